pub mod device;
pub mod oauth;
pub mod refresh;

pub use device::{DeviceAuthorizer, PollOutcome};
pub use oauth::OAuthEndpoints;
pub use refresh::TokenRefresher;
