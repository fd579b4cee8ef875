use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::error;

use crate::auth::refresh::needs_refresh;
use crate::auth::{DeviceAuthorizer, OAuthEndpoints, PollOutcome, TokenRefresher};
use crate::error::MonitorError;
use crate::http::ReqwestHttp;
use crate::monitor::{self, Monitor};
use crate::notify::onebot::OneBotNotifier;
use crate::notify::{self, LogNotifier, Notification, Notifier};
use crate::storage::{
    self, Account, AccountDraft, AccountMode, Config, CredentialSlot, CredentialStore,
    Credentials, LoginCredentials, PendingAuthorization,
};

fn open(dir: Option<PathBuf>) -> Result<(CredentialStore, Config)> {
    let store = CredentialStore::new(dir)?;
    let config = store.load_config()?;
    Ok((store, config))
}

fn http_for(config: &Config) -> Result<ReqwestHttp, MonitorError> {
    ReqwestHttp::new(
        config.settings.request_timeout_secs,
        config.settings.insecure_tls,
    )
}

fn resolve_slot(store: &CredentialStore, account: Option<&str>) -> Result<CredentialSlot> {
    match account {
        Some(key) => {
            let account = store.find_account(key)?;
            if account.mode != AccountMode::Rest {
                anyhow::bail!("Account '{}' uses SOAP and does not need tokens", account.name);
            }
            Ok(CredentialSlot::Account(account.id))
        }
        None => Ok(CredentialSlot::Global),
    }
}

fn format_time(epoch: u64) -> String {
    DateTime::from_timestamp(epoch as i64, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

// -- Checks ---------------------------------------------------------------------

pub fn cmd_check(dir: Option<PathBuf>) -> Result<()> {
    let (store, config) = open(dir)?;

    let http = match http_for(&config) {
        Ok(http) => http,
        Err(e) => {
            LogNotifier.notify(&monitor::dependency_failure(&e));
            return Err(e.into());
        }
    };

    let endpoints = OAuthEndpoints::default();
    let refresher = TokenRefresher::new(&http, &store, &endpoints);
    let monitor = Monitor::new(&http, &refresher, &config.settings);
    let notifier = notify::from_config(&config.notifier, &http);

    let mut accounts = store.load_accounts()?;
    let legacy = store.legacy_account()?;

    let result = monitor::run_and_notify(&monitor, &mut accounts, move || legacy, &*notifier);

    let throttled: usize = result.throttled.iter().map(|(_, r)| r.len()).sum();
    eprintln!(
        "Checked {} account(s): {} throttled, {} warning(s).",
        result.throttled.len() + result.all_clear.len(),
        throttled,
        result.warnings.len()
    );
    Ok(())
}

pub fn cmd_watch(dir: Option<PathBuf>, interval_minutes: u64) -> Result<()> {
    if interval_minutes == 0 {
        anyhow::bail!("--interval-minutes must be at least 1");
    }
    eprintln!("Checking every {} minute(s). Press Ctrl-C to stop.", interval_minutes);

    loop {
        if let Err(e) = cmd_check(dir.clone()) {
            let reason = format!("{:#}", e);
            error!(%reason, "scheduled check failed");
        }
        thread::sleep(Duration::from_secs(interval_minutes * 60));
    }
}

// -- Accounts -------------------------------------------------------------------

pub fn cmd_accounts(dir: Option<PathBuf>) -> Result<()> {
    let (_, config) = open(dir)?;

    if config.accounts.is_empty() {
        eprintln!("No accounts configured. Run `throttlewatch add --name <name>` to get started.");
        eprintln!("Checks use the top-level settings ({} mode).", config.settings.api_mode);
        return Ok(());
    }

    for account in &config.accounts {
        let marker = if account.enabled { "" } else { " [disabled]" };
        println!("{}{} ({}, {})", account.name, marker, account.mode, account.id);
    }
    Ok(())
}

pub fn cmd_add(dir: Option<PathBuf>, draft: AccountDraft) -> Result<()> {
    let (store, _) = open(dir)?;
    let account = store.add_account(draft)?;

    eprintln!("Account saved: {} ({}, {})", account.name, account.mode, account.id);
    if account.mode == AccountMode::Rest {
        eprintln!(
            "Authorize it with: throttlewatch auth login --account {}",
            account.name
        );
    }
    Ok(())
}

pub fn cmd_remove(dir: Option<PathBuf>, key: &str) -> Result<()> {
    let (store, _) = open(dir)?;
    let account = store.remove_account(key)?;
    eprintln!("Removed {}.", account.name);
    Ok(())
}

pub fn cmd_set_enabled(dir: Option<PathBuf>, key: &str, enabled: bool) -> Result<()> {
    let (store, _) = open(dir)?;
    let account = store.set_enabled(key, enabled)?;
    eprintln!(
        "{} {}.",
        account.name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

// -- Device authorization ---------------------------------------------------------

fn print_pending(pending: &PendingAuthorization) {
    eprintln!("Open this link and sign in:");
    eprintln!(
        "  {}",
        pending
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&pending.verification_uri)
    );
    eprintln!("User code: {}", pending.user_code);
    eprintln!("Code expires at {}.", format_time(pending.expires_at));
}

pub fn cmd_auth_start(dir: Option<PathBuf>, account: Option<&str>) -> Result<()> {
    let (store, config) = open(dir)?;
    let slot = resolve_slot(&store, account)?;
    let http = http_for(&config)?;
    let endpoints = OAuthEndpoints::default();

    let pending = DeviceAuthorizer::new(&http, &store, &endpoints).start()?;
    store.save_pending(&slot, &pending)?;

    print_pending(&pending);
    eprintln!("Then run `throttlewatch auth poll` with the same target.");
    Ok(())
}

pub fn cmd_auth_poll(dir: Option<PathBuf>, account: Option<&str>) -> Result<()> {
    let (store, config) = open(dir)?;
    let slot = resolve_slot(&store, account)?;
    let mut pending = store
        .load_pending(&slot)?
        .context("No pending authorization. Run `throttlewatch auth start` first")?;

    let http = http_for(&config)?;
    let endpoints = OAuthEndpoints::default();
    let authorizer = DeviceAuthorizer::new(&http, &store, &endpoints);

    match authorizer.poll(&pending, &slot) {
        Ok(PollOutcome::Authorized(_)) => {
            store.clear_pending(&slot)?;
            eprintln!("Authorized. Tokens saved to {}.", slot);
        }
        Ok(PollOutcome::Pending { interval }) => {
            if interval != pending.interval {
                pending.interval = interval;
                store.save_pending(&slot, &pending)?;
            }
            eprintln!("Still waiting for approval. Poll again in {}s.", interval);
        }
        Ok(PollOutcome::Expired) => {
            store.clear_pending(&slot)?;
            anyhow::bail!("Device code expired. Run `throttlewatch auth start` again");
        }
        Err(e) => {
            store.clear_pending(&slot)?;
            return Err(e.into());
        }
    }
    Ok(())
}

pub fn cmd_auth_login(dir: Option<PathBuf>, account: Option<&str>) -> Result<()> {
    let (store, config) = open(dir)?;
    let slot = resolve_slot(&store, account)?;
    let http = http_for(&config)?;
    let endpoints = OAuthEndpoints::default();
    let authorizer = DeviceAuthorizer::new(&http, &store, &endpoints);

    let mut pending = authorizer.start()?;
    store.save_pending(&slot, &pending)?;
    print_pending(&pending);
    eprintln!("Waiting for authorization...");

    loop {
        thread::sleep(Duration::from_secs(pending.interval));
        match authorizer.poll(&pending, &slot) {
            Ok(PollOutcome::Authorized(_)) => break,
            Ok(PollOutcome::Pending { interval }) => pending.interval = interval,
            Ok(PollOutcome::Expired) => {
                store.clear_pending(&slot)?;
                anyhow::bail!("Device code expired before it was approved");
            }
            Err(e) => {
                store.clear_pending(&slot)?;
                return Err(e.into());
            }
        }
    }

    store.clear_pending(&slot)?;
    eprintln!("Authorized. Tokens saved to {}.", slot);
    Ok(())
}

pub fn cmd_auth_revoke(dir: Option<PathBuf>, account: Option<&str>) -> Result<()> {
    let (store, config) = open(dir)?;
    let slot = resolve_slot(&store, account)?;
    let http = http_for(&config)?;
    let endpoints = OAuthEndpoints::default();

    DeviceAuthorizer::new(&http, &store, &endpoints).revoke(&slot)?;
    store.clear_pending(&slot)?;

    eprintln!("Tokens for {} cleared.", slot);
    Ok(())
}

pub fn cmd_auth_set_login(
    dir: Option<PathBuf>,
    account: Option<&str>,
    username: String,
    secret: String,
) -> Result<()> {
    let (store, config) = open(dir)?;
    let slot = resolve_login_slot(&store, account)?;

    store.set_login(&slot, LoginCredentials { username, secret })?;

    eprintln!("SOAP login saved to {}.", slot);
    if slot == CredentialSlot::Global && config.settings.api_mode != AccountMode::LegacySoap {
        eprintln!("Set `api_mode = \"legacy_soap\"` under [settings] to use it for checks.");
    }
    Ok(())
}

fn resolve_login_slot(store: &CredentialStore, account: Option<&str>) -> Result<CredentialSlot> {
    match account {
        Some(key) => {
            let account = store.find_account(key)?;
            if account.mode != AccountMode::LegacySoap {
                anyhow::bail!("Account '{}' uses REST; authorize it with `auth login`", account.name);
            }
            Ok(CredentialSlot::Account(account.id))
        }
        None => Ok(CredentialSlot::Global),
    }
}

// -- Status ---------------------------------------------------------------------

fn credential_state(account: &Account) -> String {
    match &account.credentials {
        Some(Credentials::Tokens(tokens)) if tokens.is_empty() => {
            "no tokens (run `auth login`)".to_string()
        }
        Some(Credentials::Tokens(tokens)) => {
            let now = storage::now();
            let expiry = match tokens.expires_at {
                Some(ts) if ts <= now => format!("expired at {}", format_time(ts)),
                Some(ts) => format!("valid until {}", format_time(ts)),
                None if tokens.access_token.is_some() => "no expiry recorded".to_string(),
                None => "not yet issued".to_string(),
            };
            let refresh = if tokens.refresh_token.is_some() {
                "refresh token stored"
            } else {
                "no refresh token"
            };
            let due = if needs_refresh(tokens, now) {
                " | refresh due"
            } else {
                ""
            };
            format!("access token {} | {}{}", expiry, refresh, due)
        }
        Some(Credentials::Login(login)) => format!("login {}", login.username),
        None => "no login (run `auth set-login`)".to_string(),
    }
}

pub fn cmd_status(dir: Option<PathBuf>) -> Result<()> {
    let (store, config) = open(dir)?;
    let accounts = store.load_accounts()?;
    let creds = store.load_credentials()?;

    let mut rows = vec![store.legacy_account()?];
    rows.extend(accounts);

    for account in &rows {
        let label = if account.slot == CredentialSlot::Global {
            format!("{} [global, {}]", account.name, config.settings.api_mode)
        } else if account.enabled {
            format!("{} [{}]", account.name, account.mode)
        } else {
            format!("{} [{}, disabled]", account.name, account.mode)
        };
        println!("{} -- {}", label, credential_state(account));

        if let Some(pending) = creds.pending.get(&account.slot.key()) {
            println!(
                "  pending authorization {} (expires {})",
                pending.user_code,
                format_time(pending.expires_at)
            );
        }
    }
    Ok(())
}

// -- Notifier -------------------------------------------------------------------

pub fn cmd_notify_test(dir: Option<PathBuf>) -> Result<()> {
    let (_, config) = open(dir)?;
    let title = "throttlewatch test";
    let text = "Notifications from throttlewatch are working.";

    match &config.notifier.onebot {
        Some(onebot) => {
            let http = http_for(&config)?;
            OneBotNotifier::new(onebot.clone(), &http)
                .send(title, text)
                .map_err(|reason| anyhow::anyhow!("OneBot delivery failed: {}", reason))?;
            eprintln!("Test message sent via OneBot.");
        }
        None => {
            LogNotifier.notify(&Notification {
                title: title.to_string(),
                text: text.to_string(),
                success: true,
            });
            eprintln!("No notifier configured; message written to the log.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccountConfig, StoredCredential, TokenSet};

    fn rest(tokens: TokenSet) -> Account {
        Account::from_config(
            &AccountConfig {
                id: "a".to_string(),
                name: "main".to_string(),
                enabled: true,
                mode: AccountMode::Rest,
            },
            Some(&StoredCredential {
                tokens,
                login: None,
            }),
        )
    }

    #[test]
    fn status_describes_token_state() {
        assert!(credential_state(&rest(TokenSet::default())).starts_with("no tokens"));

        let lazy = rest(TokenSet {
            access_token: None,
            refresh_token: Some("rt".to_string()),
            expires_at: None,
        });
        let state = credential_state(&lazy);
        assert!(state.contains("not yet issued"));
        assert!(state.ends_with("refresh due"));

        let fresh = rest(TokenSet {
            access_token: Some("at".to_string()),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(storage::now() + 3600),
        });
        let state = credential_state(&fresh);
        assert!(state.contains("valid until"));
        assert!(!state.contains("refresh due"));
    }

    #[test]
    fn account_flag_resolves_to_its_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::open(dir.path()).unwrap();
        let added = store
            .add_account(AccountDraft {
                name: "main".to_string(),
                ..AccountDraft::default()
            })
            .unwrap();

        assert_eq!(resolve_slot(&store, None).unwrap(), CredentialSlot::Global);
        assert_eq!(
            resolve_slot(&store, Some("main")).unwrap(),
            CredentialSlot::Account(added.id)
        );
        assert!(resolve_slot(&store, Some("nope")).is_err());
    }

    #[test]
    fn login_slot_accepts_global_or_soap_accounts_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CredentialStore::open(dir.path()).unwrap();
        store
            .add_account(AccountDraft {
                name: "rest".to_string(),
                ..AccountDraft::default()
            })
            .unwrap();
        let soap = store
            .add_account(AccountDraft {
                name: "old".to_string(),
                mode: Some(AccountMode::LegacySoap),
                username: Some("1".to_string()),
                secret: Some("p".to_string()),
                ..AccountDraft::default()
            })
            .unwrap();

        assert_eq!(resolve_login_slot(&store, None).unwrap(), CredentialSlot::Global);
        assert_eq!(
            resolve_login_slot(&store, Some("old")).unwrap(),
            CredentialSlot::Account(soap.id)
        );
        assert!(resolve_login_slot(&store, Some("rest")).is_err());
    }

    #[test]
    fn set_login_makes_the_legacy_soap_fallback_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.toml"),
            "[settings]\napi_mode = \"legacy_soap\"\n",
        )
        .unwrap();

        cmd_auth_set_login(
            Some(dir.path().to_path_buf()),
            None,
            "12345".to_string(),
            "api-pass".to_string(),
        )
        .unwrap();

        let store = CredentialStore::open(dir.path()).unwrap();
        let legacy = store.legacy_account().unwrap();
        assert_eq!(legacy.mode, AccountMode::LegacySoap);
        assert_eq!(
            legacy.login().map(|l| l.username.as_str()),
            Some("12345")
        );
    }
}
