use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_REST_BASE_URL: &str = "https://www.servercontrolpanel.de/scp-core";
pub const DEFAULT_SOAP_URL: &str = "https://www.servercontrolpanel.de/WSEndUser";

/// Top-level config file (no token secrets). Stored as config.toml.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Recognized top-level options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Mode of the implicit account used when no account is enabled.
    #[serde(default)]
    pub api_mode: AccountMode,
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_soap_url")]
    pub soap_url: String,
    #[serde(default = "default_true")]
    pub notify_all_clear: bool,
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default)]
    pub debug_dump: bool,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Config {
    /// Rejects endpoint settings that are not absolute http(s) URLs.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_url("settings.rest_base_url", &self.settings.rest_base_url)?;
        check_url("settings.soap_url", &self.settings.soap_url)?;
        if let Some(onebot) = &self.notifier.onebot {
            check_url("notifier.onebot.server", &onebot.server)?;
        }
        Ok(())
    }
}

fn check_url(field: &str, value: &str) -> anyhow::Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| anyhow::anyhow!("{} is not a valid URL ({}): {}", field, value, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => anyhow::bail!("{} must use http or https, not {}", field, other),
    }
}

fn default_rest_base_url() -> String {
    DEFAULT_REST_BASE_URL.to_string()
}

fn default_soap_url() -> String {
    DEFAULT_SOAP_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    crate::http::DEFAULT_TIMEOUT_SECS
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_mode: AccountMode::default(),
            rest_base_url: default_rest_base_url(),
            soap_url: default_soap_url(),
            notify_all_clear: true,
            insecure_tls: false,
            debug_dump: false,
            request_timeout_secs: default_timeout(),
            language: default_language(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onebot: Option<OneBotConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneBotConfig {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Private,
    Group,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountMode {
    #[default]
    Rest,
    #[serde(alias = "soap")]
    LegacySoap,
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountMode::Rest => write!(f, "rest"),
            AccountMode::LegacySoap => write!(f, "soap"),
        }
    }
}

/// Account metadata as stored in config.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AccountMode,
}

/// Request record for adding an account.
#[derive(Debug, Clone, Default)]
pub struct AccountDraft {
    pub name: String,
    /// Defaults to REST.
    pub mode: Option<AccountMode>,
    /// Defaults to true.
    pub enabled: Option<bool>,
    /// Required for SOAP accounts.
    pub username: Option<String>,
    pub secret: Option<String>,
}

// -- Credentials ---------------------------------------------------------------

/// Where a set of credentials lives in credentials.json.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialSlot {
    Global,
    Account(String),
}

impl CredentialSlot {
    pub fn key(&self) -> String {
        match self {
            CredentialSlot::Global => "global".to_string(),
            CredentialSlot::Account(id) => format!("account/{}", id),
        }
    }
}

impl fmt::Display for CredentialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl TokenSet {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub username: String,
    pub secret: String,
}

/// A single stored credential slot keyed as "global" or "account/<id>".
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(default)]
    pub tokens: TokenSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginCredentials>,
}

/// A device authorization waiting for the user. Kept between CLI
/// invocations so `auth poll` can resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Epoch seconds.
    pub expires_at: u64,
    /// Seconds between polls.
    pub interval: u64,
}

/// Top-level credentials file. Stored as credentials.json with 0600 perms.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub credentials: BTreeMap<String, StoredCredential>,
    #[serde(default)]
    pub pending: BTreeMap<String, PendingAuthorization>,
}

// -- Runtime account -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    Tokens(TokenSet),
    Login(LoginCredentials),
}

/// An account ready to be checked: metadata joined with its credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub mode: AccountMode,
    pub slot: CredentialSlot,
    pub credentials: Option<Credentials>,
}

impl Account {
    pub fn from_config(config: &AccountConfig, stored: Option<&StoredCredential>) -> Self {
        let slot = CredentialSlot::Account(config.id.clone());
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            enabled: config.enabled,
            mode: config.mode,
            credentials: credentials_for(config.mode, stored),
            slot,
        }
    }

    /// The implicit account built from top-level settings and the global slot.
    pub fn legacy(settings: &Settings, stored: Option<&StoredCredential>) -> Self {
        Self {
            id: "legacy".to_string(),
            name: "default".to_string(),
            enabled: true,
            mode: settings.api_mode,
            credentials: credentials_for(settings.api_mode, stored),
            slot: CredentialSlot::Global,
        }
    }

    pub fn tokens_mut(&mut self) -> Option<&mut TokenSet> {
        match self.credentials.as_mut() {
            Some(Credentials::Tokens(tokens)) => Some(tokens),
            _ => None,
        }
    }

    pub fn login(&self) -> Option<&LoginCredentials> {
        match self.credentials.as_ref() {
            Some(Credentials::Login(login)) => Some(login),
            _ => None,
        }
    }
}

fn credentials_for(mode: AccountMode, stored: Option<&StoredCredential>) -> Option<Credentials> {
    match mode {
        AccountMode::Rest => Some(Credentials::Tokens(
            stored.map(|s| s.tokens.clone()).unwrap_or_default(),
        )),
        AccountMode::LegacySoap => stored
            .and_then(|s| s.login.clone())
            .map(Credentials::Login),
    }
}
