use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Resource, ResourceList, UNKNOWN_ADDRESS};
use crate::auth::TokenRefresher;
use crate::error::{MonitorError, MonitorResult};
use crate::http::HttpClient;
use crate::storage::{CredentialSlot, TokenSet};

const SERVER_KEYS: &[&str] = &["servers", "resources"];
const INTERFACE_KEYS: &[&str] = &["interfaces", "attributes"];

/// One REST check for one account. A 401 triggers at most one token
/// refresh for the whole session and a single retry of the failed request.
pub struct RestSession<'a> {
    http: &'a dyn HttpClient,
    refresher: &'a TokenRefresher<'a>,
    base: String,
    slot: &'a CredentialSlot,
    tokens: &'a mut TokenSet,
    refreshed: bool,
}

impl<'a> RestSession<'a> {
    pub fn new(
        http: &'a dyn HttpClient,
        refresher: &'a TokenRefresher<'a>,
        base_url: &str,
        slot: &'a CredentialSlot,
        tokens: &'a mut TokenSet,
    ) -> Self {
        Self {
            http,
            refresher,
            base: base_url.trim_end_matches('/').to_string(),
            slot,
            tokens,
            refreshed: false,
        }
    }

    pub fn check(mut self) -> MonitorResult<ResourceList> {
        let url = format!("{}/api/v1/servers", self.base);
        let body = self.get_json(&url)?;
        let servers = unwrap_list(body, SERVER_KEYS).ok_or_else(|| {
            MonitorError::MalformedResponse("server list is not an array".to_string())
        })?;

        let mut list = ResourceList::default();
        for server in &servers {
            let Some(id) = string_field(server, &["id", "serverId", "uuid", "vServerName"]) else {
                debug!(entry = %server, "server entry without id skipped");
                continue;
            };
            let name = string_field(server, &["vServerName", "hostname"]).unwrap_or_else(|| id.clone());

            let url = format!("{}/api/v1/servers/{}/interfaces", self.base, id);
            let interfaces = self.get_json(&url).and_then(|body| {
                unwrap_list(body, INTERFACE_KEYS).ok_or_else(|| {
                    MonitorError::MalformedResponse("interface list is not an array".to_string())
                })
            });
            let interfaces = match interfaces {
                Ok(interfaces) => interfaces,
                Err(e @ MonitorError::Unauthorized(_)) => return Err(e),
                Err(e) => {
                    list.warn(MonitorError::PartialResourceFailure {
                        resource: name,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let resource = evaluate(id, name, server, &interfaces);
            debug!(resource = %resource, throttled = resource.throttled, "server checked");
            list.resources.push(resource);
        }

        info!(
            slot = %self.slot,
            servers = list.resources.len(),
            throttled = list.resources.iter().filter(|r| r.throttled).count(),
            "REST check finished"
        );
        Ok(list)
    }

    fn get_json(&mut self, url: &str) -> MonitorResult<Value> {
        let response = self.http.get(url, Some(self.access_token()?))?;
        if response.status != 401 {
            return body_json(response.status, &response.body);
        }

        if self.refreshed {
            return Err(MonitorError::Unauthorized(format!("{} rejected the token", url)));
        }
        self.refreshed = true;
        warn!(slot = %self.slot, %url, "401 from provider, refreshing token once");
        self.refresher.refresh(self.slot, self.tokens)?;

        let retry = self.http.get(url, Some(self.access_token()?))?;
        if retry.status == 401 {
            return Err(MonitorError::Unauthorized(format!(
                "{} rejected the refreshed token",
                url
            )));
        }
        body_json(retry.status, &retry.body)
    }

    fn access_token(&self) -> MonitorResult<&str> {
        self.tokens.access_token.as_deref().ok_or_else(|| {
            MonitorError::MissingCredentials(format!("no access token for {}", self.slot))
        })
    }
}

fn body_json(status: u16, body: &str) -> MonitorResult<Value> {
    if !(200..300).contains(&status) {
        return Err(MonitorError::from_status(status, body));
    }
    serde_json::from_str(body)
        .map_err(|e| MonitorError::MalformedResponse(format!("invalid JSON: {}", e)))
}

/// Accepts a bare array or an object wrapping the array under one of `keys`.
fn unwrap_list(value: Value, keys: &[&str]) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => keys
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn evaluate(id: String, name: String, server: &Value, interfaces: &[Value]) -> Resource {
    let throttled_iface = interfaces
        .iter()
        .find(|i| i.get("trafficThrottled").and_then(Value::as_bool) == Some(true));

    let primary_address = throttled_iface
        .and_then(|i| string_list(i, "ipv4IP").into_iter().next())
        .or_else(|| first_address(&string_list(server, "ips")))
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

    Resource {
        id,
        name,
        primary_address,
        throttled: throttled_iface.is_some(),
    }
}

/// First IPv4 address, else the first address of any kind.
fn first_address(ips: &[String]) -> Option<String> {
    ips.iter()
        .find(|ip| !ip.contains(':'))
        .or_else(|| ips.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OAuthEndpoints;
    use crate::http::testing::{FakeHttp, Method};
    use crate::storage::testing::MemoryTokenStore;
    use crate::storage::{self, Account, AccountMode, Credentials, Settings};
    use crate::provider::StatusChecker;

    const BASE: &str = "https://scp.test/core";
    const SERVERS: &str = "https://scp.test/core/api/v1/servers";
    const TOKEN: &str = "https://id.test/token";

    fn iface_url(id: &str) -> String {
        format!("{}/{}/interfaces", SERVERS, id)
    }

    fn settings() -> Settings {
        Settings {
            rest_base_url: format!("{}/", BASE),
            ..Settings::default()
        }
    }

    fn endpoints() -> OAuthEndpoints {
        OAuthEndpoints {
            token_url: TOKEN.to_string(),
            ..OAuthEndpoints::default()
        }
    }

    fn account() -> Account {
        Account {
            id: "a1".to_string(),
            name: "main".to_string(),
            enabled: true,
            mode: AccountMode::Rest,
            slot: CredentialSlot::Account("a1".to_string()),
            credentials: Some(Credentials::Tokens(TokenSet {
                access_token: Some("at-1".to_string()),
                refresh_token: Some("rt-1".to_string()),
                expires_at: Some(storage::now() + 3600),
            })),
        }
    }

    fn run(http: &FakeHttp, store: &MemoryTokenStore, account: &mut Account) -> MonitorResult<ResourceList> {
        let eps = endpoints();
        let settings = settings();
        let refresher = TokenRefresher::new(http, store, &eps);
        StatusChecker::new(http, &refresher, &settings).check(account)
    }

    #[test]
    fn wrapped_servers_with_throttled_interface() {
        let http = FakeHttp::new();
        http.on(
            Method::Get,
            SERVERS,
            200,
            r#"{"servers":[{"id":"s1","vServerName":"v1","ips":["1.2.3.4"]}]}"#,
        );
        http.on(
            Method::Get,
            &iface_url("s1"),
            200,
            r#"[{"trafficThrottled":true,"ipv4IP":["5.6.7.8"]}]"#,
        );
        let store = MemoryTokenStore::new();

        let list = run(&http, &store, &mut account()).unwrap();

        assert_eq!(
            list.resources,
            vec![Resource {
                id: "s1".to_string(),
                name: "v1".to_string(),
                primary_address: "5.6.7.8".to_string(),
                throttled: true,
            }]
        );
        assert_eq!(http.calls()[0].bearer.as_deref(), Some("at-1"));
    }

    #[test]
    fn bare_array_without_throttling() {
        let http = FakeHttp::new();
        http.on(Method::Get, SERVERS, 200, r#"[{"id":"s2","ips":["9.9.9.9"]}]"#);
        http.on(
            Method::Get,
            &iface_url("s2"),
            200,
            r#"[{"trafficThrottled":false}]"#,
        );
        let store = MemoryTokenStore::new();

        let list = run(&http, &store, &mut account()).unwrap();

        assert_eq!(list.resources.len(), 1);
        assert!(list.throttled().is_empty());
        assert_eq!(list.resources[0].name, "s2");
        assert_eq!(list.resources[0].primary_address, "9.9.9.9");
    }

    #[test]
    fn non_array_server_list_is_malformed() {
        let http = FakeHttp::new();
        http.on(Method::Get, SERVERS, 200, r#"{"items":[]}"#);
        let store = MemoryTokenStore::new();

        let err = run(&http, &store, &mut account()).unwrap_err();
        assert!(matches!(err, MonitorError::MalformedResponse(_)));
    }

    #[test]
    fn address_falls_back_to_ipv4_then_unknown() {
        let http = FakeHttp::new();
        http.on(
            Method::Get,
            SERVERS,
            200,
            r#"[{"id":"a","ips":["2001:db8::1","10.0.0.1"]},{"id":"b"}]"#,
        );
        http.on(
            Method::Get,
            &iface_url("a"),
            200,
            r#"{"interfaces":[{"trafficThrottled":true}]}"#,
        );
        http.on(
            Method::Get,
            &iface_url("b"),
            200,
            r#"[{"trafficThrottled":true,"ipv4IP":[]}]"#,
        );
        let store = MemoryTokenStore::new();

        let list = run(&http, &store, &mut account()).unwrap();

        assert_eq!(list.resources[0].primary_address, "10.0.0.1");
        assert_eq!(list.resources[1].primary_address, UNKNOWN_ADDRESS);
        assert!(list.resources.iter().all(|r| r.throttled));
    }

    #[test]
    fn one_failing_interface_fetch_does_not_hide_the_rest() {
        let http = FakeHttp::new();
        http.on(
            Method::Get,
            SERVERS,
            200,
            r#"[{"id":"ok1"},{"id":"bad"},{"id":"ok2"}]"#,
        );
        http.on(
            Method::Get,
            &iface_url("ok1"),
            200,
            r#"[{"trafficThrottled":true,"ipv4IP":["1.1.1.1"]}]"#,
        );
        http.on(Method::Get, &iface_url("bad"), 500, "boom");
        http.on(Method::Get, &iface_url("ok2"), 200, "[]");
        let store = MemoryTokenStore::new();

        let list = run(&http, &store, &mut account()).unwrap();

        let ids: Vec<&str> = list.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ok1", "ok2"]);
        assert_eq!(list.warnings.len(), 1);
        assert!(list.warnings[0].contains("bad"));
    }

    #[test]
    fn unrecognized_interface_body_is_a_warning_not_all_clear() {
        let http = FakeHttp::new();
        http.on(Method::Get, SERVERS, 200, r#"[{"id":"s1"},{"id":"s2"}]"#);
        http.on(
            Method::Get,
            &iface_url("s1"),
            200,
            r#"{"error":"maintenance"}"#,
        );
        http.on(
            Method::Get,
            &iface_url("s2"),
            200,
            r#"{"attributes":[{"trafficThrottled":true}]}"#,
        );
        let store = MemoryTokenStore::new();

        let list = run(&http, &store, &mut account()).unwrap();

        let ids: Vec<&str> = list.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["s2"]);
        assert!(list.resources[0].throttled);
        assert_eq!(list.warnings.len(), 1);
        assert!(list.warnings[0].contains("s1"));
        assert!(list.warnings[0].contains("malformed response"));
    }

    #[test]
    fn unauthorized_refreshes_once_and_retries_once() {
        let http = FakeHttp::new();
        http.on(Method::Get, SERVERS, 401, "")
            .on(Method::Get, SERVERS, 200, "[]");
        http.on(
            Method::Form,
            TOKEN,
            200,
            r#"{"access_token":"at-2","refresh_token":"rt-2","expires_in":300}"#,
        );
        let store = MemoryTokenStore::new();
        let mut acct = account();

        let list = run(&http, &store, &mut acct).unwrap();

        assert!(list.resources.is_empty());
        assert_eq!(http.count(Method::Form, TOKEN), 1);
        assert_eq!(http.count(Method::Get, SERVERS), 2);
        assert_eq!(http.calls()[2].bearer.as_deref(), Some("at-2"));
        let tokens = acct.tokens_mut().unwrap().clone();
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-2"));
        assert_eq!(store.get(&acct.slot), Some(tokens));
    }

    #[test]
    fn second_unauthorized_surfaces_without_looping() {
        let http = FakeHttp::new();
        http.on(Method::Get, SERVERS, 401, "");
        http.on(
            Method::Form,
            TOKEN,
            200,
            r#"{"access_token":"at-2","expires_in":300}"#,
        );
        let store = MemoryTokenStore::new();

        let err = run(&http, &store, &mut account()).unwrap_err();

        assert!(matches!(err, MonitorError::Unauthorized(_)));
        assert_eq!(http.count(Method::Form, TOKEN), 1);
        assert_eq!(http.count(Method::Get, SERVERS), 2);
    }

    #[test]
    fn unauthorized_on_later_request_after_refresh_is_not_retried_again() {
        let http = FakeHttp::new();
        http.on(Method::Get, SERVERS, 401, "")
            .on(Method::Get, SERVERS, 200, r#"[{"id":"s1"}]"#);
        http.on(Method::Get, &iface_url("s1"), 401, "");
        http.on(
            Method::Form,
            TOKEN,
            200,
            r#"{"access_token":"at-2","expires_in":300}"#,
        );
        let store = MemoryTokenStore::new();

        let err = run(&http, &store, &mut account()).unwrap_err();

        assert!(matches!(err, MonitorError::Unauthorized(_)));
        assert_eq!(http.count(Method::Form, TOKEN), 1);
        assert_eq!(http.count(Method::Get, &iface_url("s1")), 1);
    }

    #[test]
    fn repeated_checks_are_identical() {
        let http = FakeHttp::new();
        http.on(
            Method::Get,
            SERVERS,
            200,
            r#"[{"id":"s1","vServerName":"v1"},{"id":"s2","vServerName":"v2"}]"#,
        );
        http.on(
            Method::Get,
            &iface_url("s1"),
            200,
            r#"[{"trafficThrottled":true,"ipv4IP":["5.6.7.8"]}]"#,
        );
        http.on(Method::Get, &iface_url("s2"), 200, "[]");
        let store = MemoryTokenStore::new();
        let mut acct = account();

        let first = run(&http, &store, &mut acct).unwrap();
        let second = run(&http, &store, &mut acct).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let value: Value = serde_json::json!({"id": 4711, "hostname": "box"});
        assert_eq!(string_field(&value, &["id"]).as_deref(), Some("4711"));
        assert_eq!(
            string_field(&value, &["vServerName", "hostname"]).as_deref(),
            Some("box")
        );
    }
}
