use std::time::Duration;

use serde_json::Value;

use crate::error::{MonitorError, MonitorResult};

pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Status and raw body of a completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    #[cfg(test)]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// All network I/O goes through this trait.
///
/// Implementations only fail for transport problems; HTTP error statuses
/// come back as a normal `HttpResponse` so callers can decide what a 401
/// or a 400 means for them.
pub trait HttpClient {
    fn get(&self, url: &str, bearer: Option<&str>) -> MonitorResult<HttpResponse>;
    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> MonitorResult<HttpResponse>;
    fn post_json(&self, url: &str, bearer: Option<&str>, body: &Value)
        -> MonitorResult<HttpResponse>;
    fn post_soap(&self, url: &str, action: &str, envelope: &str) -> MonitorResult<HttpResponse>;
}

pub struct ReqwestHttp {
    client: reqwest::blocking::Client,
}

impl ReqwestHttp {
    pub fn new(timeout_secs: u64, insecure_tls: bool) -> MonitorResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(insecure_tls)
            .user_agent(concat!("throttlewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MonitorError::DependencyMissing(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn finish(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> MonitorResult<HttpResponse> {
        let response = request
            .send()
            .map_err(|e| MonitorError::ProviderUnreachable(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| MonitorError::ProviderUnreachable(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpClient for ReqwestHttp {
    fn get(&self, url: &str, bearer: Option<&str>) -> MonitorResult<HttpResponse> {
        let mut request = self.client.get(url).header("Accept", "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.finish(request)
    }

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> MonitorResult<HttpResponse> {
        self.finish(self.client.post(url).form(form))
    }

    fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> MonitorResult<HttpResponse> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.finish(request)
    }

    fn post_soap(&self, url: &str, action: &str, envelope: &str) -> MonitorResult<HttpResponse> {
        let request = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}\"", action))
            .body(envelope.to_string());
        self.finish(request)
    }
}
