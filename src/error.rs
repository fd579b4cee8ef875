use thiserror::Error;

/// Failures raised by the token lifecycle and the status check.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("failed to fetch details for {resource}: {reason}")]
    PartialResourceFailure { resource: String, reason: String },

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl MonitorError {
    /// Maps a non-success HTTP status to the matching variant.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 401 || status == 403 {
            MonitorError::Unauthorized(format!("HTTP {}", status))
        } else {
            MonitorError::UnexpectedStatus {
                status,
                body: truncate(body, 200),
            }
        }
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_401_maps_to_unauthorized() {
        assert!(matches!(
            MonitorError::from_status(401, ""),
            MonitorError::Unauthorized(_)
        ));
    }

    #[test]
    fn other_status_keeps_truncated_body() {
        let body = "x".repeat(500);
        match MonitorError::from_status(502, &body) {
            MonitorError::UnexpectedStatus { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), 203);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
