//! Enumeration requests: parsing from JSON/YAML and validation.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::mcp::types::ServerSpec;

pub const MIN_TIMEOUT_SECS: u64 = 5;
pub const MAX_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Malformed(String),
    #[error("no MCP servers configured")]
    NoServers,
    #[error("too many servers: {count} (limit {limit})")]
    TooManyServers { count: usize, limit: usize },
    #[error("timeout_seconds must be between 5 and 300, got {0}")]
    TimeoutOutOfRange(u64),
    #[error("server `{server}`: timeout must be at most 300 seconds, got {secs}")]
    ServerTimeoutOutOfRange { server: String, secs: u64 },
}

/// A full enumeration request; `servers` keeps declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumerationRequest {
    pub servers: Vec<(String, ServerSpec)>,
    pub timeout_seconds: u64,
    pub include_schemas: bool,
    pub parallel_discovery: bool,
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    mcp_json: Option<RawServers>,
    #[serde(default, rename = "mcpServers")]
    mcp_servers: Option<JsonMap<String, JsonValue>>,
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
    #[serde(default = "enabled")]
    include_schemas: bool,
    #[serde(default = "enabled")]
    parallel_discovery: bool,
}

#[derive(Deserialize)]
struct RawServers {
    #[serde(rename = "mcpServers")]
    mcp_servers: JsonMap<String, JsonValue>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn enabled() -> bool {
    true
}

impl EnumerationRequest {
    /// Accepts `{mcp_json: {mcpServers: {...}}, ...}` or the bare `{mcpServers: {...}}`.
    pub fn from_json_value(value: JsonValue) -> Result<Self, RequestError> {
        let raw: RawRequest =
            serde_json::from_value(value).map_err(|e| RequestError::Malformed(e.to_string()))?;
        let map = match (raw.mcp_json, raw.mcp_servers) {
            (Some(wrapped), _) => wrapped.mcp_servers,
            (None, Some(bare)) => bare,
            (None, None) => {
                return Err(RequestError::Malformed(
                    "expected `mcp_json.mcpServers` or `mcpServers`".to_string(),
                ));
            }
        };
        let mut servers = Vec::with_capacity(map.len());
        for (name, entry) in map {
            let spec: ServerSpec = serde_json::from_value(entry)
                .map_err(|e| RequestError::Malformed(format!("server `{name}`: {e}")))?;
            servers.push((name, spec));
        }
        Ok(Self {
            servers,
            timeout_seconds: raw.timeout_seconds,
            include_schemas: raw.include_schemas,
            parallel_discovery: raw.parallel_discovery,
        })
    }

    /// Parse a JSON document, falling back to YAML.
    pub fn from_document(text: &str) -> Result<Self, RequestError> {
        let value = match serde_json::from_str::<JsonValue>(text) {
            Ok(v) => v,
            Err(json_err) => serde_yaml::from_str::<JsonValue>(text).map_err(|yaml_err| {
                RequestError::Malformed(format!(
                    "neither JSON ({json_err}) nor YAML ({yaml_err})"
                ))
            })?,
        };
        Self::from_json_value(value)
    }

    pub fn validate(&self, max_servers: usize) -> Result<(), RequestError> {
        if self.servers.is_empty() {
            return Err(RequestError::NoServers);
        }
        if self.servers.len() > max_servers {
            return Err(RequestError::TooManyServers {
                count: self.servers.len(),
                limit: max_servers,
            });
        }
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.timeout_seconds) {
            return Err(RequestError::TimeoutOutOfRange(self.timeout_seconds));
        }
        if let Some((name, secs)) = self
            .servers
            .iter()
            .find_map(|(name, spec)| spec.timeout.filter(|t| *t > MAX_TIMEOUT_SECS).map(|t| (name, t)))
        {
            return Err(RequestError::ServerTimeoutOutOfRange {
                server: name.clone(),
                secs,
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrapped_shape_keeps_declaration_order() {
        let req = EnumerationRequest::from_json_value(json!({
            "mcp_json": {"mcpServers": {
                "zeta": {"url": "http://z"},
                "alpha": {"command": "node", "args": ["a.js"]},
                "mid": {}
            }},
            "timeout_seconds": 10,
            "include_schemas": false
        }))
        .expect("parses");
        let names: Vec<_> = req.servers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(req.timeout_seconds, 10);
        assert!(!req.include_schemas);
        assert!(req.parallel_discovery);
    }

    #[test]
    fn bare_shape_uses_defaults() {
        let req = EnumerationRequest::from_json_value(json!({"mcpServers": {"a": {"command": "x"}}}))
            .unwrap();
        assert_eq!(req.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        assert!(req.include_schemas);
        assert!(req.validate(64).is_ok());
    }

    #[test]
    fn yaml_documents_are_accepted() {
        let doc = "mcpServers:\n  files:\n    command: npx\n    args: [\"-y\", \"server-fs\"]\n  web:\n    url: https://example.test/mcp\ntimeout_seconds: 45\n";
        let req = EnumerationRequest::from_document(doc).unwrap();
        assert_eq!(req.servers[0].0, "files");
        assert_eq!(req.servers[1].1.url.as_deref(), Some("https://example.test/mcp"));
        assert_eq!(req.timeout_seconds, 45);
    }

    #[test]
    fn empty_server_map_is_rejected() {
        let req = EnumerationRequest::from_json_value(json!({"mcp_json": {"mcpServers": {}}})).unwrap();
        assert_eq!(req.validate(64), Err(RequestError::NoServers));
    }

    #[test]
    fn limits_are_enforced() {
        let req = EnumerationRequest::from_json_value(json!({
            "mcpServers": {"a": {}, "b": {}, "c": {}}
        }))
        .unwrap();
        assert_eq!(
            req.validate(2),
            Err(RequestError::TooManyServers { count: 3, limit: 2 })
        );
        for bad in [4, 301] {
            let req = EnumerationRequest::from_json_value(json!({
                "mcpServers": {"a": {}}, "timeout_seconds": bad
            }))
            .unwrap();
            assert_eq!(req.validate(64), Err(RequestError::TimeoutOutOfRange(bad)));
        }
    }

    #[test]
    fn oversized_server_timeouts_are_rejected() {
        let req = EnumerationRequest::from_json_value(json!({
            "mcpServers": {"ok": {"timeout": 300}, "huge": {"timeout": u64::MAX}}
        }))
        .unwrap();
        assert_eq!(
            req.validate(64),
            Err(RequestError::ServerTimeoutOutOfRange {
                server: "huge".to_string(),
                secs: u64::MAX
            })
        );
        assert!(req.validate(64).unwrap_err().to_string().contains("server `huge`"));
    }

    #[test]
    fn missing_servers_and_bad_entries_are_malformed() {
        assert!(matches!(
            EnumerationRequest::from_json_value(json!({"timeout_seconds": 10})),
            Err(RequestError::Malformed(_))
        ));
        let err = EnumerationRequest::from_json_value(json!({"mcpServers": {"a": {"args": "not-a-list"}}}))
            .unwrap_err();
        assert!(err.to_string().contains("server `a`"));
    }
}
