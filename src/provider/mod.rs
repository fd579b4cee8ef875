pub mod rest;
pub mod soap;

use std::fmt;

use crate::auth::TokenRefresher;
use crate::error::{MonitorError, MonitorResult};
use crate::http::HttpClient;
use crate::storage::{Account, AccountMode, Settings};

pub const UNKNOWN_ADDRESS: &str = "unknown";

/// A monitored VPS as seen during one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub primary_address: String,
    pub throttled: bool,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.primary_address)
    }
}

/// Resources of one account, in provider order, plus per-resource warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceList {
    pub resources: Vec<Resource>,
    pub warnings: Vec<String>,
}

impl ResourceList {
    pub fn throttled(&self) -> Vec<Resource> {
        self.resources.iter().filter(|r| r.throttled).cloned().collect()
    }

    pub(crate) fn warn(&mut self, error: MonitorError) {
        tracing::warn!(%error, "resource skipped");
        self.warnings.push(error.to_string());
    }
}

pub struct StatusChecker<'a> {
    http: &'a dyn HttpClient,
    refresher: &'a TokenRefresher<'a>,
    settings: &'a Settings,
}

impl<'a> StatusChecker<'a> {
    pub fn new(
        http: &'a dyn HttpClient,
        refresher: &'a TokenRefresher<'a>,
        settings: &'a Settings,
    ) -> Self {
        Self {
            http,
            refresher,
            settings,
        }
    }

    pub fn check(&self, account: &mut Account) -> MonitorResult<ResourceList> {
        match account.mode {
            AccountMode::Rest => {
                let slot = account.slot.clone();
                let tokens = account.tokens_mut().ok_or_else(|| {
                    MonitorError::MissingCredentials(format!("{} has no token set", slot))
                })?;
                rest::RestSession::new(
                    self.http,
                    self.refresher,
                    &self.settings.rest_base_url,
                    &slot,
                    tokens,
                )
                .check()
            }
            AccountMode::LegacySoap => {
                let login = account.login().ok_or_else(|| {
                    MonitorError::MissingCredentials(format!(
                        "{} needs a username and secret for SOAP",
                        account.name
                    ))
                })?;
                soap::SoapClient::new(self.http, self.settings).check(login)
            }
        }
    }
}
