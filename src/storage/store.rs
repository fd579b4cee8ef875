use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use super::types::*;
use crate::error::MonitorResult;

const CONFIG_FILE: &str = "config.toml";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Persistence for token sets, addressed by credential slot.
///
/// `save_tokens` must either fully replace the slot's tokens or fail
/// without touching them.
pub trait TokenStore {
    fn load_tokens(&self, slot: &CredentialSlot) -> MonitorResult<TokenSet>;
    fn save_tokens(&self, slot: &CredentialSlot, tokens: &TokenSet) -> MonitorResult<()>;
    fn clear_tokens(&self, slot: &CredentialSlot) -> MonitorResult<()>;
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub struct CredentialStore {
    config_path: PathBuf,
    credentials_path: PathBuf,
}

impl CredentialStore {
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("throttlewatch"),
        };
        Self::open(&config_dir)
    }

    pub fn open(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)
            .with_context(|| format!("Could not create {}", config_dir.display()))?;
        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE),
            credentials_path: config_dir.join(CREDENTIALS_FILE),
        })
    }

    // -- Config (no secrets) --------------------------------------------------

    pub fn load_config(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(&self.config_path)?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", self.config_path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", self.config_path.display()))?;
        Ok(config)
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        let contents = toml::to_string_pretty(config)?;
        write_atomic(&self.config_path, contents.as_bytes())?;
        Ok(())
    }

    // -- Credentials (secrets, 0600) ------------------------------------------

    pub fn load_credentials(&self) -> MonitorResult<CredentialsFile> {
        if !self.credentials_path.exists() {
            return Ok(CredentialsFile::default());
        }
        let contents = fs::read_to_string(&self.credentials_path)?;
        let creds: CredentialsFile = serde_json::from_str(&contents)?;
        Ok(creds)
    }

    pub fn save_credentials(&self, creds: &CredentialsFile) -> MonitorResult<()> {
        let contents = serde_json::to_string_pretty(creds)?;
        write_atomic(&self.credentials_path, contents.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.credentials_path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn update_slot(
        &self,
        slot: &CredentialSlot,
        apply: impl FnOnce(&mut StoredCredential),
    ) -> MonitorResult<()> {
        let mut creds = self.load_credentials()?;
        apply(creds.credentials.entry(slot.key()).or_default());
        self.save_credentials(&creds)
    }

    // -- Accounts -------------------------------------------------------------

    /// Accounts from config.toml joined with their stored credentials.
    pub fn load_accounts(&self) -> Result<Vec<Account>> {
        let config = self.load_config()?;
        let creds = self.load_credentials()?;
        Ok(config
            .accounts
            .iter()
            .map(|a| {
                let slot = CredentialSlot::Account(a.id.clone());
                Account::from_config(a, creds.credentials.get(&slot.key()))
            })
            .collect())
    }

    pub fn legacy_account(&self) -> Result<Account> {
        let config = self.load_config()?;
        let creds = self.load_credentials()?;
        Ok(Account::legacy(
            &config.settings,
            creds.credentials.get(&CredentialSlot::Global.key()),
        ))
    }

    pub fn add_account(&self, draft: AccountDraft) -> Result<AccountConfig> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            anyhow::bail!("Account name must not be empty");
        }

        let mut config = self.load_config()?;
        if config.accounts.iter().any(|a| a.name == name) {
            anyhow::bail!("Account '{}' already exists", name);
        }

        let mode = draft.mode.unwrap_or_default();
        let login = match (draft.username, draft.secret) {
            (Some(username), Some(secret)) => Some(LoginCredentials { username, secret }),
            (None, None) => None,
            _ => anyhow::bail!("Both --username and --secret are required together"),
        };
        if mode == AccountMode::LegacySoap && login.is_none() {
            anyhow::bail!("SOAP accounts need --username and --secret");
        }

        let account = AccountConfig {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name,
            enabled: draft.enabled.unwrap_or(true),
            mode,
        };

        if let Some(login) = login {
            self.update_slot(&CredentialSlot::Account(account.id.clone()), |c| {
                c.login = Some(login)
            })?;
        }

        config.accounts.push(account.clone());
        self.save_config(&config)?;
        Ok(account)
    }

    /// Resolves an account by id or by name.
    pub fn find_account(&self, key: &str) -> Result<AccountConfig> {
        let config = self.load_config()?;
        config
            .accounts
            .iter()
            .find(|a| a.id == key || a.name == key)
            .cloned()
            .context(format!("Account '{}' not found", key))
    }

    pub fn remove_account(&self, key: &str) -> Result<AccountConfig> {
        let account = self.find_account(key)?;

        let mut config = self.load_config()?;
        config.accounts.retain(|a| a.id != account.id);
        self.save_config(&config)?;

        let slot_key = CredentialSlot::Account(account.id.clone()).key();
        let mut creds = self.load_credentials()?;
        creds.credentials.remove(&slot_key);
        creds.pending.remove(&slot_key);
        self.save_credentials(&creds)?;

        Ok(account)
    }

    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<AccountConfig> {
        let target = self.find_account(key)?;
        let mut config = self.load_config()?;
        let account = config
            .accounts
            .iter_mut()
            .find(|a| a.id == target.id)
            .context(format!("Account '{}' not found", key))?;
        account.enabled = enabled;
        let updated = account.clone();
        self.save_config(&config)?;
        Ok(updated)
    }

    /// Stores the SOAP login for `slot`, replacing any previous one. The
    /// `global` slot feeds the implicit account used in `legacy_soap` mode.
    pub fn set_login(&self, slot: &CredentialSlot, login: LoginCredentials) -> Result<()> {
        if login.username.trim().is_empty() || login.secret.is_empty() {
            anyhow::bail!("Both --username and --secret must be non-empty");
        }
        self.update_slot(slot, |c| c.login = Some(login))?;
        Ok(())
    }

    // -- Pending device authorizations ----------------------------------------

    pub fn save_pending(
        &self,
        slot: &CredentialSlot,
        pending: &PendingAuthorization,
    ) -> MonitorResult<()> {
        let mut creds = self.load_credentials()?;
        creds.pending.insert(slot.key(), pending.clone());
        self.save_credentials(&creds)
    }

    pub fn load_pending(&self, slot: &CredentialSlot) -> MonitorResult<Option<PendingAuthorization>> {
        Ok(self.load_credentials()?.pending.get(&slot.key()).cloned())
    }

    pub fn clear_pending(&self, slot: &CredentialSlot) -> MonitorResult<()> {
        let mut creds = self.load_credentials()?;
        if creds.pending.remove(&slot.key()).is_some() {
            self.save_credentials(&creds)?;
        }
        Ok(())
    }
}

impl TokenStore for CredentialStore {
    fn load_tokens(&self, slot: &CredentialSlot) -> MonitorResult<TokenSet> {
        Ok(self
            .load_credentials()?
            .credentials
            .get(&slot.key())
            .map(|c| c.tokens.clone())
            .unwrap_or_default())
    }

    fn save_tokens(&self, slot: &CredentialSlot, tokens: &TokenSet) -> MonitorResult<()> {
        self.update_slot(slot, |c| c.tokens = tokens.clone())
    }

    fn clear_tokens(&self, slot: &CredentialSlot) -> MonitorResult<()> {
        self.update_slot(slot, |c| c.tokens = TokenSet::default())
    }
}

/// Writes through a sibling temp file and a rename so readers never see a
/// partially written file.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
