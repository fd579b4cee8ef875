use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info};

use super::{Resource, ResourceList, UNKNOWN_ADDRESS};
use crate::error::{MonitorError, MonitorResult};
use crate::http::HttpClient;
use crate::storage::{LoginCredentials, Settings};

const NAMESPACE: &str = "http://enduser.service.web.vcp.netcup.de/";

/// Legacy credential-based API. Every call carries the login; there is no
/// session.
pub struct SoapClient<'a> {
    http: &'a dyn HttpClient,
    url: &'a str,
    language: &'a str,
    debug_dump: bool,
}

impl<'a> SoapClient<'a> {
    pub fn new(http: &'a dyn HttpClient, settings: &'a Settings) -> Self {
        Self {
            http,
            url: &settings.soap_url,
            language: &settings.language,
            debug_dump: settings.debug_dump,
        }
    }

    pub fn check(&self, login: &LoginCredentials) -> MonitorResult<ResourceList> {
        if login.username.is_empty() || login.secret.is_empty() {
            return Err(MonitorError::MissingCredentials(
                "SOAP login name or password is empty".to_string(),
            ));
        }

        let names = self.list_servers(login)?;
        let mut list = ResourceList::default();

        for name in names {
            match self.server_info(login, &name) {
                Ok(resource) => {
                    debug!(resource = %resource, throttled = resource.throttled, "server checked");
                    list.resources.push(resource);
                }
                Err(e) => list.warn(MonitorError::PartialResourceFailure {
                    resource: name,
                    reason: e.to_string(),
                }),
            }
        }

        info!(
            servers = list.resources.len(),
            throttled = list.resources.iter().filter(|r| r.throttled).count(),
            "SOAP check finished"
        );
        Ok(list)
    }

    fn list_servers(&self, login: &LoginCredentials) -> MonitorResult<Vec<String>> {
        let body = self.call("getVServers", login, &[])?;
        Ok(body
            .descendants("return")
            .into_iter()
            .map(|n| n.text.clone())
            .filter(|t| !t.is_empty())
            .collect())
    }

    fn server_info(&self, login: &LoginCredentials, name: &str) -> MonitorResult<Resource> {
        let body = self.call(
            "getVServerInformation",
            login,
            &[("vservername", name), ("language", self.language)],
        )?;
        if self.debug_dump {
            info!(server = name, detail = ?body, "raw server information");
        }

        let info = body
            .descendants("return")
            .into_iter()
            .next()
            .ok_or_else(|| MonitorError::MalformedResponse("no server information".to_string()))?;

        let primary_address = info
            .children_named("ips")
            .map(|n| n.text.clone())
            .find(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

        let throttled = info.children_named("serverInterfaces").any(|iface| {
            iface
                .children_named("trafficThrottled")
                .any(|flag| flag.text.eq_ignore_ascii_case("true"))
        });

        Ok(Resource {
            id: name.to_string(),
            name: name.to_string(),
            primary_address,
            throttled,
        })
    }

    fn call(
        &self,
        operation: &str,
        login: &LoginCredentials,
        params: &[(&str, &str)],
    ) -> MonitorResult<XmlNode> {
        let envelope = envelope(operation, login, params);
        let response = self.http.post_soap(self.url, operation, &envelope)?;
        let tree = parse_xml(&response.body);

        // Faults usually come back as HTTP 500 with a readable faultstring.
        if let Ok(root) = &tree {
            if let Some(fault) = root.descendants("faultstring").into_iter().next() {
                return Err(classify_fault(&fault.text, response.status));
            }
        }
        if !response.is_success() {
            return Err(MonitorError::from_status(response.status, &response.body));
        }
        tree
    }
}

fn envelope(operation: &str, login: &LoginCredentials, params: &[(&str, &str)]) -> String {
    let mut fields = format!(
        "<loginName>{}</loginName><password>{}</password>",
        escape(login.username.as_str()),
        escape(login.secret.as_str())
    );
    for (key, value) in params {
        fields.push_str(&format!("<{0}>{1}</{0}>", key, escape(*value)));
    }
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ns="{ns}">"#,
            "<soapenv:Body><ns:{op}>{fields}</ns:{op}></soapenv:Body></soapenv:Envelope>"
        ),
        ns = NAMESPACE,
        op = operation,
        fields = fields
    )
}

fn classify_fault(text: &str, status: u16) -> MonitorError {
    let lower = text.to_lowercase();
    if ["password", "login", "auth", "credential"]
        .iter()
        .any(|k| lower.contains(k))
    {
        MonitorError::Unauthorized(text.to_string())
    } else {
        MonitorError::UnexpectedStatus {
            status,
            body: text.to_string(),
        }
    }
}

/// Minimal element tree; namespaces are dropped and only local names kept.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn named(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Self::default()
        }
    }

    fn children_named<'n>(&'n self, name: &'n str) -> impl Iterator<Item = &'n XmlNode> + 'n {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Depth-first search; does not descend into a match.
    fn descendants(&self, name: &str) -> Vec<&XmlNode> {
        let mut found = Vec::new();
        for child in &self.children {
            if child.name == name {
                found.push(child);
            } else {
                found.extend(child.descendants(name));
            }
        }
        found
    }
}

pub(crate) fn parse_xml(xml: &str) -> MonitorResult<XmlNode> {
    let malformed = |e: String| MonitorError::MalformedResponse(format!("SOAP response: {}", e));

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![XmlNode::default()];
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(XmlNode::named(e.local_name().as_ref())),
            Ok(Event::Empty(e)) => {
                let node = XmlNode::named(e.local_name().as_ref());
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::End(_)) => {
                let node = stack.pop().filter(|_| !stack.is_empty());
                match (node, stack.last_mut()) {
                    (Some(node), Some(parent)) => parent.children.push(node),
                    _ => return Err(malformed("unbalanced end tag".to_string())),
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| malformed(e.to_string()))?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                let bytes = c.into_inner();
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(e.to_string())),
        }
    }

    match stack.pop() {
        Some(root) if stack.is_empty() && !root.children.is_empty() => Ok(root),
        _ => Err(malformed("truncated or empty document".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::http::testing::{FakeHttp, Method};

    fn wrap(op: &str, inner: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/">
  <S:Body>
    <ns2:{op}Response xmlns:ns2="http://enduser.service.web.vcp.netcup.de/">{inner}</ns2:{op}Response>
  </S:Body>
</S:Envelope>"#
        )
    }

    fn info(ips: &[&str], throttled: &[bool]) -> String {
        let ips: String = ips.iter().map(|ip| format!("<ips>{}</ips>", ip)).collect();
        let ifaces: String = throttled
            .iter()
            .map(|t| {
                format!(
                    "<serverInterfaces><mac>00:00</mac><trafficThrottled>{}</trafficThrottled></serverInterfaces>",
                    t
                )
            })
            .collect();
        wrap(
            "getVServerInformation",
            &format!("<return>{}{}<status>online</status></return>", ips, ifaces),
        )
    }

    fn login() -> LoginCredentials {
        LoginCredentials {
            username: "12345".to_string(),
            secret: "p<w>&".to_string(),
        }
    }

    #[test]
    fn throttled_and_clear_servers() {
        let http = FakeHttp::new();
        http.on(
            Method::Soap,
            "getVServers",
            200,
            &wrap("getVServers", "<return>v1</return><return>v2</return>"),
        );
        http.on(
            Method::Soap,
            "getVServerInformation",
            200,
            &info(&["1.2.3.4", "2001:db8::1"], &[false, true]),
        )
        .on(
            Method::Soap,
            "getVServerInformation",
            200,
            &info(&[], &[false]),
        );
        let settings = Settings::default();

        let list = SoapClient::new(&http, &settings).check(&login()).unwrap();

        assert_eq!(
            list.resources,
            vec![
                Resource {
                    id: "v1".to_string(),
                    name: "v1".to_string(),
                    primary_address: "1.2.3.4".to_string(),
                    throttled: true,
                },
                Resource {
                    id: "v2".to_string(),
                    name: "v2".to_string(),
                    primary_address: UNKNOWN_ADDRESS.to_string(),
                    throttled: false,
                },
            ]
        );
        assert!(list.warnings.is_empty());
    }

    #[test]
    fn credentials_are_sent_escaped_on_every_call() {
        let http = FakeHttp::new();
        http.on(
            Method::Soap,
            "getVServers",
            200,
            &wrap("getVServers", "<return>v1</return>"),
        );
        http.on(
            Method::Soap,
            "getVServerInformation",
            200,
            &info(&["1.2.3.4"], &[false]),
        );
        let settings = Settings::default();

        SoapClient::new(&http, &settings).check(&login()).unwrap();

        let calls = http.calls();
        assert_eq!(calls.len(), 2);
        for call in &calls {
            assert!(call.body.contains("<loginName>12345</loginName>"));
            assert!(call.body.contains("<password>p&lt;w&gt;&amp;</password>"));
        }
        assert!(calls[1].body.contains("<vservername>v1</vservername>"));
        assert!(calls[1].body.contains("<language>en</language>"));
    }

    #[test]
    fn broken_detail_becomes_a_warning() {
        let http = FakeHttp::new();
        http.on(
            Method::Soap,
            "getVServers",
            200,
            &wrap("getVServers", "<return>good</return><return>bad</return><return>good2</return>"),
        );
        http.on(
            Method::Soap,
            "getVServerInformation",
            200,
            &info(&["1.1.1.1"], &[true]),
        )
        .on(Method::Soap, "getVServerInformation", 200, "<html>oops")
        .on(
            Method::Soap,
            "getVServerInformation",
            200,
            &info(&["2.2.2.2"], &[false]),
        );
        let settings = Settings::default();

        let list = SoapClient::new(&http, &settings).check(&login()).unwrap();

        let names: Vec<&str> = list.resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["good", "good2"]);
        assert_eq!(list.warnings.len(), 1);
        assert!(list.warnings[0].contains("bad"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn check_with_logs(debug_dump: bool) -> String {
        let http = FakeHttp::new();
        http.on(
            Method::Soap,
            "getVServers",
            200,
            &wrap("getVServers", "<return>v1</return>"),
        );
        http.on(
            Method::Soap,
            "getVServerInformation",
            200,
            &info(&["1.2.3.4"], &[false]),
        );
        let settings = Settings {
            debug_dump,
            ..Settings::default()
        };

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            SoapClient::new(&http, &settings).check(&login()).unwrap();
        });

        let bytes = logs.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn debug_dump_is_visible_at_info_level() {
        assert!(check_with_logs(true).contains("raw server information"));
        assert!(!check_with_logs(false).contains("raw server information"));
    }

    #[test]
    fn login_fault_is_unauthorized() {
        let http = FakeHttp::new();
        http.on(
            Method::Soap,
            "getVServers",
            500,
            r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Body><S:Fault>
                <faultcode>S:Server</faultcode><faultstring>validation error: wrong password</faultstring>
               </S:Fault></S:Body></S:Envelope>"#,
        );
        let settings = Settings::default();

        let err = SoapClient::new(&http, &settings)
            .check(&login())
            .unwrap_err();
        assert!(matches!(err, MonitorError::Unauthorized(_)));
    }

    #[test]
    fn empty_login_is_missing_credentials() {
        let http = FakeHttp::new();
        let settings = Settings::default();
        let err = SoapClient::new(&http, &settings)
            .check(&LoginCredentials {
                username: String::new(),
                secret: "x".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, MonitorError::MissingCredentials(_)));
        assert!(http.calls().is_empty());
    }

    #[test]
    fn parse_keeps_local_names_and_text() {
        let root = parse_xml("<a:x xmlns:a=\"urn:a\"><a:y>1 &amp; 2</a:y><z/></a:x>").unwrap();
        let x = &root.children[0];
        assert_eq!(x.name, "x");
        assert_eq!(x.children[0].name, "y");
        assert_eq!(x.children[0].text, "1 & 2");
        assert_eq!(x.children[1].name, "z");
    }

    #[test]
    fn truncated_xml_is_malformed() {
        assert!(matches!(
            parse_xml("<a><b>"),
            Err(MonitorError::MalformedResponse(_))
        ));
    }
}
