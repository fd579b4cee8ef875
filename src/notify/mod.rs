pub mod onebot;

use tracing::{error, info};

use crate::http::HttpClient;
use crate::storage::NotifierConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub text: String,
    pub success: bool,
}

/// One-way delivery of a run summary. Delivery problems are logged by the
/// implementation and never returned to the caller.
pub trait Notifier {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log when no transport is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        if notification.success {
            info!(title = %notification.title, "{}", notification.text);
        } else {
            error!(title = %notification.title, "{}", notification.text);
        }
    }
}

pub fn from_config<'a>(config: &NotifierConfig, http: &'a dyn HttpClient) -> Box<dyn Notifier + 'a> {
    match &config.onebot {
        Some(onebot) => Box::new(onebot::OneBotNotifier::new(onebot.clone(), http)),
        None => Box::new(LogNotifier),
    }
}
