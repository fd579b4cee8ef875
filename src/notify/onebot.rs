use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{Notification, Notifier};
use crate::http::HttpClient;
use crate::storage::{MessageType, OneBotConfig};

/// Sends notifications through a OneBot v11 HTTP endpoint.
pub struct OneBotNotifier<'a> {
    config: OneBotConfig,
    http: &'a dyn HttpClient,
}

#[derive(Debug, Deserialize)]
struct OneBotReply {
    status: Option<String>,
    retcode: Option<i64>,
    msg: Option<String>,
    message: Option<String>,
}

impl<'a> OneBotNotifier<'a> {
    pub fn new(config: OneBotConfig, http: &'a dyn HttpClient) -> Self {
        Self { config, http }
    }

    /// Delivers one message; the error string describes why it was not sent.
    pub fn send(&self, title: &str, text: &str) -> Result<(), String> {
        let server = self.config.server.trim_end_matches('/');
        if server.is_empty() {
            return Err("OneBot server address is not configured".to_string());
        }

        let message = if title.is_empty() {
            text.to_string()
        } else {
            format!("{}\n\n{}", title, text)
        };

        let (endpoint, body) = match self.config.message_type {
            MessageType::Private => {
                let user_id = self.config.user_id.ok_or("OneBot user_id is not configured")?;
                (
                    format!("{}/send_private_msg", server),
                    json!({ "user_id": user_id, "message": message }),
                )
            }
            MessageType::Group => {
                let group_id = self
                    .config
                    .group_id
                    .ok_or("OneBot group_id is not configured")?;
                (
                    format!("{}/send_group_msg", server),
                    json!({ "group_id": group_id, "message": message }),
                )
            }
        };

        let response = self
            .http
            .post_json(&endpoint, self.config.access_token.as_deref(), &body)
            .map_err(|e| e.to_string())?;

        if response.status != 200 {
            return Err(format!("HTTP {}", response.status));
        }

        let reply: OneBotReply = serde_json::from_str(&response.body)
            .map_err(|e| format!("unreadable reply: {}", e))?;
        if reply.status.as_deref() == Some("ok") && reply.retcode == Some(0) {
            Ok(())
        } else {
            Err(reply
                .msg
                .or(reply.message)
                .unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

impl Notifier for OneBotNotifier<'_> {
    fn notify(&self, notification: &Notification) {
        match self.send(&notification.title, &notification.text) {
            Ok(()) => info!(title = %notification.title, "OneBot message sent"),
            Err(reason) => warn!(title = %notification.title, %reason, "OneBot message failed"),
        }
    }
}
