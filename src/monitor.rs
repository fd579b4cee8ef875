use tracing::{error, info, warn};

use crate::auth::TokenRefresher;
use crate::error::MonitorError;
use crate::http::HttpClient;
use crate::notify::{Notification, Notifier};
use crate::provider::{Resource, StatusChecker};
use crate::storage::{Account, AccountMode, Settings};

/// Outcome of one run over all accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    /// Accounts with at least one throttled resource, in processing order.
    pub throttled: Vec<(String, Vec<Resource>)>,
    /// Accounts without throttling and their total resource count.
    pub all_clear: Vec<(String, usize)>,
    pub warnings: Vec<String>,
}

impl CheckResult {
    pub fn has_throttled(&self) -> bool {
        self.throttled.iter().any(|(_, r)| !r.is_empty())
    }
}

pub struct Monitor<'a> {
    http: &'a dyn HttpClient,
    refresher: &'a TokenRefresher<'a>,
    settings: &'a Settings,
}

impl<'a> Monitor<'a> {
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

    /// Checks every enabled account in order. `legacy` is used on its own
    /// when none of `accounts` is enabled.
    pub fn run(&self, accounts: &mut [Account], legacy: impl FnOnce() -> Account) -> CheckResult {
        let mut fallback;
        let mut enabled: Vec<&mut Account> = accounts.iter_mut().filter(|a| a.enabled).collect();
        if enabled.is_empty() {
            info!("no enabled accounts, using top-level configuration");
            fallback = legacy();
            enabled.push(&mut fallback);
        }

        let checker = StatusChecker::new(self.http, self.refresher, self.settings);
        let mut result = CheckResult::default();

        for account in enabled {
            let name = account.name.clone();
            match self.check_account(&checker, account) {
                Ok(list) => {
                    result
                        .warnings
                        .extend(list.warnings.iter().map(|w| format!("{}: {}", name, w)));
                    let throttled = list.throttled();
                    if throttled.is_empty() {
                        result.all_clear.push((name, list.resources.len()));
                    } else {
                        warn!(account = %name, count = throttled.len(), "throttled servers found");
                        result.throttled.push((name, throttled));
                    }
                }
                Err(e) => {
                    error!(account = %name, error = %e, "account check failed");
                    result.warnings.push(format!("{}: {}", name, e));
                }
            }
        }

        result
    }

    fn check_account(
        &self,
        checker: &StatusChecker<'_>,
        account: &mut Account,
    ) -> Result<crate::provider::ResourceList, MonitorError> {
        if account.mode == AccountMode::Rest {
            let slot = account.slot.clone();
            let tokens = account.tokens_mut().ok_or_else(|| {
                MonitorError::MissingCredentials(format!("{} has no token set", slot))
            })?;
            self.refresher.ensure_valid(&slot, tokens)?;
        }
        checker.check(account)
    }
}

/// Picks the single notification for a run, if any.
pub fn build_notification(result: &CheckResult, notify_all_clear: bool) -> Option<Notification> {
    let has_warnings = !result.warnings.is_empty();
    let mut text;
    let title;
    let success;

    if result.has_throttled() {
        title = "⚠️ VPS throttled";
        success = false;
        text = String::from("The following VPS are currently throttled:");
        for (account, resources) in &result.throttled {
            text.push_str(&format!("\n[{}]", account));
            for resource in resources {
                text.push_str(&format!("\n• {}", resource));
            }
        }
        for (account, total) in &result.all_clear {
            text.push_str(&format!("\n{}: 0 throttled of {}", account, total));
        }
    } else if notify_all_clear && !(result.all_clear.is_empty() && has_warnings) {
        title = "🟢 All VPS clear";
        success = true;
        text = result
            .all_clear
            .iter()
            .map(|(account, total)| format!("{}: 0 throttled of {}", account, total))
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            text = String::from("No accounts could be checked.");
        }
    } else if has_warnings {
        title = "🔴 VPS monitor warnings";
        success = false;
        text = String::from("No VPS is throttled, but some checks failed.");
    } else {
        return None;
    }

    if has_warnings {
        text.push_str("\n\nWarnings:");
        for warning in &result.warnings {
            text.push_str(&format!("\n- {}", warning));
        }
    }

    Some(Notification {
        title: title.to_string(),
        text,
        success,
    })
}

/// Runs one check and emits at most one notification.
pub fn run_and_notify(
    monitor: &Monitor<'_>,
    accounts: &mut [Account],
    legacy: impl FnOnce() -> Account,
    notifier: &dyn Notifier,
) -> CheckResult {
    let result = monitor.run(accounts, legacy);
    match build_notification(&result, monitor.settings.notify_all_clear) {
        Some(notification) => notifier.notify(&notification),
        None => info!("all clear, notification disabled"),
    }
    result
}

/// Reported instead of a run when the transport cannot be set up.
pub fn dependency_failure(error: &MonitorError) -> Notification {
    Notification {
        title: "🔴 VPS monitor error".to_string(),
        text: error.to_string(),
        success: false,
    }
}
