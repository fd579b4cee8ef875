use serde::Deserialize;

use crate::error::{MonitorError, MonitorResult};
use crate::http::HttpResponse;
use crate::storage::TokenSet;

const OIDC_BASE: &str = "https://www.servercontrolpanel.de/realms/scp/protocol/openid-connect";
const CLIENT_ID: &str = "scp";
const SCOPE: &str = "offline_access openid";

/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: u64 = 300;

/// OAuth endpoints of the provider's identity realm.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub device_url: String,
    pub token_url: String,
    pub revoke_url: String,
    pub client_id: String,
    pub scope: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            device_url: format!("{}/auth/device", OIDC_BASE),
            token_url: format!("{}/token", OIDC_BASE),
            revoke_url: format!("{}/revoke", OIDC_BASE),
            client_id: CLIENT_ID.to_string(),
            scope: SCOPE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl TokenResponse {
    pub fn parse(response: &HttpResponse) -> MonitorResult<Self> {
        serde_json::from_str(&response.body)
            .map_err(|e| MonitorError::MalformedResponse(format!("token response: {}", e)))
    }

    /// Converts to a token set. A missing refresh token falls back to
    /// `previous_refresh`.
    pub fn into_token_set(self, now: u64, previous_refresh: Option<String>) -> TokenSet {
        TokenSet {
            access_token: Some(self.access_token),
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: Some(now + self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
        }
    }
}

impl ErrorResponse {
    pub fn parse(response: &HttpResponse) -> Self {
        serde_json::from_str(&response.body).unwrap_or_default()
    }

    pub fn reason(&self, response: &HttpResponse) -> String {
        match (&self.error, &self.error_description) {
            (Some(e), Some(d)) => format!("{} - {}", e, d),
            (Some(e), None) => e.clone(),
            _ => format!("HTTP {}", response.status),
        }
    }
}
