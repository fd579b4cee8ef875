use serde::Deserialize;
use tracing::{info, warn};

use super::oauth::{ErrorResponse, OAuthEndpoints, TokenResponse};
use crate::error::{MonitorError, MonitorResult};
use crate::http::HttpClient;
use crate::storage::{self, CredentialSlot, PendingAuthorization, TokenSet, TokenStore};

const DEFAULT_DEVICE_EXPIRES_IN: u64 = 600;
const DEFAULT_POLL_INTERVAL: u64 = 5;
const SLOW_DOWN_STEP: u64 = 5;

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Authorized(TokenSet),
    /// Poll again after `interval` seconds.
    Pending { interval: u64 },
    Expired,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: Option<String>,
    user_code: Option<String>,
    verification_uri: Option<String>,
    verification_uri_complete: Option<String>,
    expires_in: Option<u64>,
    interval: Option<u64>,
}

/// OAuth device-authorization grant. Each call is one request; the caller
/// owns the polling loop.
pub struct DeviceAuthorizer<'a> {
    http: &'a dyn HttpClient,
    store: &'a dyn TokenStore,
    endpoints: &'a OAuthEndpoints,
}

impl<'a> DeviceAuthorizer<'a> {
    pub fn new(
        http: &'a dyn HttpClient,
        store: &'a dyn TokenStore,
        endpoints: &'a OAuthEndpoints,
    ) -> Self {
        Self {
            http,
            store,
            endpoints,
        }
    }

    pub fn start(&self) -> MonitorResult<PendingAuthorization> {
        let response = self.http.post_form(
            &self.endpoints.device_url,
            &[
                ("client_id", self.endpoints.client_id.as_str()),
                ("scope", self.endpoints.scope.as_str()),
            ],
        )?;

        if !response.is_success() {
            return Err(MonitorError::from_status(response.status, &response.body));
        }

        let data: DeviceCodeResponse = serde_json::from_str(&response.body)
            .map_err(|e| MonitorError::MalformedResponse(format!("device code response: {}", e)))?;

        let device_code = data
            .device_code
            .ok_or_else(|| MonitorError::MalformedResponse("missing device_code".to_string()))?;
        let user_code = data
            .user_code
            .ok_or_else(|| MonitorError::MalformedResponse("missing user_code".to_string()))?;
        let verification_uri = data
            .verification_uri
            .or_else(|| data.verification_uri_complete.clone())
            .ok_or_else(|| {
                MonitorError::MalformedResponse("missing verification_uri".to_string())
            })?;

        let pending = PendingAuthorization {
            device_code,
            user_code,
            verification_uri,
            verification_uri_complete: data.verification_uri_complete,
            expires_at: storage::now() + data.expires_in.unwrap_or(DEFAULT_DEVICE_EXPIRES_IN),
            interval: data.interval.unwrap_or(DEFAULT_POLL_INTERVAL).max(1),
        };

        info!(user_code = %pending.user_code, expires_at = pending.expires_at, "device authorization started");
        Ok(pending)
    }

    /// Polls the token endpoint once. On success the tokens are persisted
    /// to `slot` before being returned.
    pub fn poll(
        &self,
        pending: &PendingAuthorization,
        slot: &CredentialSlot,
    ) -> MonitorResult<PollOutcome> {
        if storage::now() >= pending.expires_at {
            return Ok(PollOutcome::Expired);
        }

        let response = self.http.post_form(
            &self.endpoints.token_url,
            &[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", pending.device_code.as_str()),
                ("client_id", self.endpoints.client_id.as_str()),
            ],
        )?;

        if response.status != 200 {
            let error = ErrorResponse::parse(&response);
            return match error.error.as_deref() {
                Some("access_denied") | Some("invalid_grant") => Err(
                    MonitorError::AuthorizationDenied(error.reason(&response)),
                ),
                Some("expired_token") => Ok(PollOutcome::Expired),
                Some("slow_down") => Ok(PollOutcome::Pending {
                    interval: pending.interval + SLOW_DOWN_STEP,
                }),
                _ => Ok(PollOutcome::Pending {
                    interval: pending.interval,
                }),
            };
        }

        let tokens = TokenResponse::parse(&response)?.into_token_set(storage::now(), None);
        self.store.save_tokens(slot, &tokens)?;

        info!(%slot, "device authorization complete");
        Ok(PollOutcome::Authorized(tokens))
    }

    /// Best-effort revocation of the stored refresh token. Local tokens for
    /// `slot` are cleared whatever the provider answers.
    pub fn revoke(&self, slot: &CredentialSlot) -> MonitorResult<()> {
        let tokens = self.store.load_tokens(slot).unwrap_or_default();

        if let Some(refresh_token) = tokens.refresh_token.as_deref() {
            let result = self.http.post_form(
                &self.endpoints.revoke_url,
                &[
                    ("client_id", self.endpoints.client_id.as_str()),
                    ("token", refresh_token),
                    ("token_type_hint", "refresh_token"),
                ],
            );
            match result {
                Ok(r) if r.is_success() => info!(%slot, "refresh token revoked"),
                Ok(r) => warn!(%slot, status = r.status, "revocation rejected"),
                Err(e) => warn!(%slot, error = %e, "revocation request failed"),
            }
        }

        self.store.clear_tokens(slot)
    }
}
