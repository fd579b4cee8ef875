use tracing::{debug, info, warn};

use super::oauth::{ErrorResponse, OAuthEndpoints, TokenResponse};
use crate::error::{MonitorError, MonitorResult};
use crate::http::HttpClient;
use crate::storage::{self, CredentialSlot, TokenSet, TokenStore};

/// Refresh this many seconds before the recorded expiry.
pub const REFRESH_LEEWAY_SECS: u64 = 60;

/// Whether `tokens` must be refreshed before use at time `now`.
pub fn needs_refresh(tokens: &TokenSet, now: u64) -> bool {
    if tokens.access_token.is_none() {
        return tokens.refresh_token.is_some();
    }
    match tokens.expires_at {
        Some(expires_at) => now >= expires_at.saturating_sub(REFRESH_LEEWAY_SECS),
        None => false,
    }
}

pub struct TokenRefresher<'a> {
    http: &'a dyn HttpClient,
    store: &'a dyn TokenStore,
    endpoints: &'a OAuthEndpoints,
}

impl<'a> TokenRefresher<'a> {
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

    /// Returns usable tokens for `slot`, refreshing `tokens` in place first
    /// when they are missing or about to expire.
    pub fn ensure_valid(
        &self,
        slot: &CredentialSlot,
        tokens: &mut TokenSet,
    ) -> MonitorResult<TokenSet> {
        if tokens.is_empty() {
            return Err(MonitorError::MissingCredentials(format!(
                "no tokens stored for {}; run `throttlewatch auth login`",
                slot
            )));
        }

        if needs_refresh(tokens, storage::now()) {
            debug!(%slot, expires_at = ?tokens.expires_at, "access token missing or expiring");
            self.refresh(slot, tokens)?;
        }
        Ok(tokens.clone())
    }

    /// Exchanges the refresh token for a new pair. The store is written
    /// before `tokens` is replaced; on any failure `tokens` is unchanged.
    pub fn refresh(&self, slot: &CredentialSlot, tokens: &mut TokenSet) -> MonitorResult<()> {
        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                MonitorError::MissingCredentials(format!("no refresh token for {}", slot))
            })?;

        let response = self.http.post_form(
            &self.endpoints.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.endpoints.client_id.as_str()),
                ("refresh_token", refresh_token),
            ],
        )?;

        if response.status != 200 {
            let reason = ErrorResponse::parse(&response).reason(&response);
            warn!(%slot, status = response.status, %reason, "token refresh rejected");
            return Err(MonitorError::RefreshFailed(reason));
        }

        let refreshed = TokenResponse::parse(&response)
            .map_err(|e| MonitorError::RefreshFailed(e.to_string()))?
            .into_token_set(storage::now(), tokens.refresh_token.clone());

        self.store.save_tokens(slot, &refreshed)?;
        *tokens = refreshed;

        info!(%slot, expires_at = ?tokens.expires_at, "access token refreshed");
        Ok(())
    }
}
