mod store;
mod types;

pub use store::{now, CredentialStore, TokenStore};
pub use types::*;

#[cfg(test)]
pub use store::testing;
