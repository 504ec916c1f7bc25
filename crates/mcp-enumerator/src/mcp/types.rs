//! Server descriptors and the discovery-method selector.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;

/// One `mcpServers` entry as written in the request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerSpec {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Per-server budget in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Declared tool metadata (array of entries or `{name: {...}}` map).
    #[serde(default)]
    pub tools: Option<JsonValue>,
}

impl ServerSpec {
    fn trimmed_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    fn trimmed_command(&self) -> Option<&str> {
        self.command.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// How a server's tools are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMethod {
    HttpDiscovery,
    StdioIntrospection,
    McpJsonParsing,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::HttpDiscovery => "http_discovery",
            DiscoveryMethod::StdioIntrospection => "stdio_introspection",
            DiscoveryMethod::McpJsonParsing => "mcp_json_parsing",
        }
    }
}

/// Pick the discovery method for a spec: url, then command, then metadata.
pub fn select(spec: &ServerSpec) -> DiscoveryMethod {
    if spec.trimmed_url().is_some() {
        DiscoveryMethod::HttpDiscovery
    } else if spec.trimmed_command().is_some() {
        DiscoveryMethod::StdioIntrospection
    } else {
        DiscoveryMethod::McpJsonParsing
    }
}

/// Connection shape of a normalized server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerTransport {
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Metadata,
}

impl ServerTransport {
    /// Short label reported per server.
    pub fn label(&self) -> &'static str {
        match self {
            ServerTransport::Http { .. } => "http",
            ServerTransport::Stdio { .. } => "stdio",
            ServerTransport::Metadata => "config",
        }
    }
}

/// Normalized server definition handed to a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: ServerTransport,
    pub timeout: Option<Duration>,
    pub declared_tools: Option<JsonValue>,
}

impl ServerDescriptor {
    pub fn from_spec(name: impl Into<String>, spec: &ServerSpec) -> Self {
        let transport = match select(spec) {
            DiscoveryMethod::HttpDiscovery => ServerTransport::Http {
                url: spec.trimmed_url().unwrap_or_default().to_string(),
                headers: spec.headers.clone().unwrap_or_default(),
            },
            DiscoveryMethod::StdioIntrospection => ServerTransport::Stdio {
                command: spec.trimmed_command().unwrap_or_default().to_string(),
                args: spec.args.clone().unwrap_or_default(),
                env: spec.env.clone().unwrap_or_default(),
            },
            DiscoveryMethod::McpJsonParsing => ServerTransport::Metadata,
        };
        Self {
            name: name.into(),
            transport,
            timeout: spec.timeout.map(Duration::from_secs),
            declared_tools: spec.tools.clone(),
        }
    }

    pub fn method(&self) -> DiscoveryMethod {
        match self.transport {
            ServerTransport::Http { .. } => DiscoveryMethod::HttpDiscovery,
            ServerTransport::Stdio { .. } => DiscoveryMethod::StdioIntrospection,
            ServerTransport::Metadata => DiscoveryMethod::McpJsonParsing,
        }
    }

    /// The URL a server is reached at: the endpoint for HTTP servers, or the
    /// first `http(s)://` argument handed to a stdio bridge.
    pub fn server_url(&self) -> Option<&str> {
        match &self.transport {
            ServerTransport::Http { url, .. } => Some(url.as_str()),
            ServerTransport::Stdio { args, .. } => args
                .iter()
                .map(String::as_str)
                .find(|a| a.starts_with("http://") || a.starts_with("https://")),
            ServerTransport::Metadata => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: JsonValue) -> ServerSpec {
        serde_json::from_value(v).expect("spec parses")
    }

    #[test]
    fn url_wins_over_command() {
        let s = spec(json!({"url": "http://localhost:9000/mcp", "command": "node"}));
        assert_eq!(select(&s), DiscoveryMethod::HttpDiscovery);
    }

    #[test]
    fn blank_url_falls_through_to_command() {
        let s = spec(json!({"url": "   ", "command": "python", "args": ["srv.py"]}));
        assert_eq!(select(&s), DiscoveryMethod::StdioIntrospection);
        let d = ServerDescriptor::from_spec("py", &s);
        assert_eq!(
            d.transport,
            ServerTransport::Stdio {
                command: "python".into(),
                args: vec!["srv.py".into()],
                env: HashMap::new(),
            }
        );
    }

    #[test]
    fn nothing_usable_means_metadata() {
        assert_eq!(select(&ServerSpec::default()), DiscoveryMethod::McpJsonParsing);
        let s = spec(json!({"command": "", "url": null}));
        assert_eq!(select(&s), DiscoveryMethod::McpJsonParsing);
        assert_eq!(ServerDescriptor::from_spec("x", &s).transport.label(), "config");
    }

    #[test]
    fn descriptor_trims_url_and_keeps_timeout() {
        let s = spec(json!({
            "url": "  https://example.test/mcp ",
            "headers": {"Authorization": "Bearer t"},
            "timeout": 7
        }));
        let d = ServerDescriptor::from_spec("remote", &s);
        assert_eq!(d.method(), DiscoveryMethod::HttpDiscovery);
        assert_eq!(d.timeout, Some(Duration::from_secs(7)));
        match d.transport {
            ServerTransport::Http { url, headers } => {
                assert_eq!(url, "https://example.test/mcp");
                assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer t"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn server_url_follows_transport() {
        let remote = ServerDescriptor::from_spec("r", &spec(json!({"url": " https://a.test/mcp "})));
        assert_eq!(remote.server_url(), Some("https://a.test/mcp"));
        let bridge = ServerDescriptor::from_spec(
            "b",
            &spec(json!({"command": "npx", "args": ["-y", "mcp-remote", "https://b.test/sse", "http://c.test"]})),
        );
        assert_eq!(bridge.server_url(), Some("https://b.test/sse"));
        let local = ServerDescriptor::from_spec("l", &spec(json!({"command": "node", "args": ["srv.js"]})));
        assert_eq!(local.server_url(), None);
        assert_eq!(ServerDescriptor::from_spec("m", &ServerSpec::default()).server_url(), None);
    }

    #[test]
    fn null_optionals_are_accepted() {
        let s = spec(json!({"command": "npx", "args": null, "env": null, "headers": null}));
        let d = ServerDescriptor::from_spec("n", &s);
        assert_eq!(d.method(), DiscoveryMethod::StdioIntrospection);
    }
}
