//! Decoding tool listings into [`DiscoveredTool`]s.
//!
//! Live JSON-RPC listings are decoded strictly: any entry that is not a tool
//! object with a name fails the whole page. REST listings and declared
//! metadata are decoded leniently and skip what they cannot read.

use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::error::DiscoveryError;

/// One tool as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredTool {
    pub server: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: JsonValue,
}

/// What one strategy found: the tools plus non-fatal notes about how.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolListing {
    pub tools: Vec<DiscoveredTool>,
    pub warnings: Vec<String>,
}

impl ToolListing {
    pub fn new(tools: Vec<DiscoveredTool>) -> Self {
        Self {
            tools,
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// One decoded `tools/list` result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPage {
    pub tools: Vec<DiscoveredTool>,
    pub next_cursor: Option<String>,
}

const SCHEMA_KEYS: [&str; 4] = ["inputSchema", "input_schema", "inSchema", "schema"];
const NAME_KEYS: [&str; 3] = ["name", "id", "tool_name"];

/// Decode a JSON-RPC `tools/list` result.
pub fn decode_tools_page(server: &str, result: &JsonValue) -> Result<ToolPage, DiscoveryError> {
    let (entries, next_cursor) = match result {
        JsonValue::Object(obj) => {
            let Some(tools) = obj.get("tools") else {
                return Err(DiscoveryError::MalformedResponse(
                    "tools/list result has no `tools` field".to_string(),
                ));
            };
            let Some(entries) = tools.as_array() else {
                return Err(DiscoveryError::MalformedResponse(
                    "`tools` is not an array".to_string(),
                ));
            };
            let cursor = obj
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            (entries, cursor)
        }
        JsonValue::Array(entries) => (entries, None),
        _ => {
            return Err(DiscoveryError::MalformedResponse(
                "tools/list result is not an object".to_string(),
            ));
        }
    };

    let mut tools = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return Err(DiscoveryError::MalformedResponse(format!(
                "tool entry {i} is not an object"
            )));
        };
        let Some(name) = first_str(obj, &NAME_KEYS) else {
            return Err(DiscoveryError::MalformedResponse(format!(
                "tool entry {i} has no name"
            )));
        };
        tools.push(tool_from_object(server, name.to_string(), obj));
    }
    Ok(ToolPage { tools, next_cursor })
}

/// Decode a REST-style listing (`[...]`, `{tools: [...]}` or `{data: [...]}`).
/// Returns `None` when the payload holds no tool array at all.
pub fn decode_rest_listing(server: &str, payload: &JsonValue) -> Option<Vec<DiscoveredTool>> {
    let entries = match payload {
        JsonValue::Array(a) => a,
        JsonValue::Object(obj) => obj
            .get("tools")
            .or_else(|| obj.get("data"))
            .and_then(|v| v.as_array())?,
        _ => return None,
    };
    Some(
        entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| lenient_entry(server, entry, Some(i)))
            .collect(),
    )
}

/// Decode declared `tools` metadata from a server configuration entry.
pub fn decode_declared(server: &str, declared: &JsonValue) -> Vec<DiscoveredTool> {
    match declared {
        JsonValue::Array(entries) => entries
            .iter()
            .filter_map(|entry| lenient_entry(server, entry, None))
            .collect(),
        JsonValue::Object(map) => map
            .iter()
            .filter_map(|(name, details)| match details {
                JsonValue::Object(obj) => {
                    let name = first_str(obj, &["name"]).unwrap_or(name.as_str()).to_string();
                    Some(tool_from_object(server, name, obj))
                }
                JsonValue::String(desc) => Some(DiscoveredTool {
                    server: server.to_string(),
                    name: name.clone(),
                    description: desc.clone(),
                    input_schema: JsonValue::Null,
                }),
                JsonValue::Null => Some(bare(server, name)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// `fallback_index` enables the `tool_{i}` name of last resort.
fn lenient_entry(
    server: &str,
    entry: &JsonValue,
    fallback_index: Option<usize>,
) -> Option<DiscoveredTool> {
    match entry {
        JsonValue::String(name) if !name.trim().is_empty() => Some(bare(server, name)),
        JsonValue::Object(obj) => {
            // `{tool_name: {...}}` wrapper form
            if obj.len() == 1
                && !obj.contains_key("name")
                && !obj.contains_key("description")
                && !SCHEMA_KEYS.iter().any(|k| obj.contains_key(*k))
            {
                let (key, details) = obj.iter().next()?;
                return match details.as_object() {
                    Some(inner) => {
                        let name = first_str(inner, &["name"]).unwrap_or(key.as_str()).to_string();
                        Some(tool_from_object(server, name, inner))
                    }
                    None => Some(bare(server, key)),
                };
            }
            let name = match first_str(obj, &NAME_KEYS) {
                Some(n) => n.to_string(),
                None => format!("tool_{}", fallback_index?),
            };
            Some(tool_from_object(server, name, obj))
        }
        _ => None,
    }
}

fn tool_from_object(server: &str, name: String, obj: &JsonMap<String, JsonValue>) -> DiscoveredTool {
    let description = first_str(obj, &["description", "summary"])
        .unwrap_or_default()
        .to_string();
    let input_schema = SCHEMA_KEYS
        .iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(JsonValue::Null);
    DiscoveredTool {
        server: server.to_string(),
        name,
        description,
        input_schema,
    }
}

fn bare(server: &str, name: &str) -> DiscoveredTool {
    DiscoveredTool {
        server: server.to_string(),
        name: name.to_string(),
        description: String::new(),
        input_schema: JsonValue::Null,
    }
}

fn first_str<'a>(obj: &'a JsonMap<String, JsonValue>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_page_keeps_order_and_cursor() {
        let page = decode_tools_page(
            "fs",
            &json!({
                "tools": [
                    {"name": "read", "description": "Read a file", "inputSchema": {"type": "object"}},
                    {"name": "write"}
                ],
                "nextCursor": "p2"
            }),
        )
        .expect("decodes");
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
        assert_eq!(page.tools.len(), 2);
        assert_eq!(page.tools[0].name, "read");
        assert_eq!(page.tools[0].input_schema, json!({"type": "object"}));
        assert_eq!(page.tools[1].description, "");
        assert_eq!(page.tools[1].input_schema, JsonValue::Null);
    }

    #[test]
    fn strict_page_rejects_nameless_entries() {
        let err = decode_tools_page("fs", &json!({"tools": [{"name": "ok"}, {"description": "x"}]}))
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::MalformedResponse(_)));
        assert!(decode_tools_page("fs", &json!({"tools": "nope"})).is_err());
        assert!(decode_tools_page("fs", &json!(42)).is_err());
    }

    #[test]
    fn rest_listing_handles_wrapped_and_nested_forms() {
        let tools = decode_rest_listing(
            "api",
            &json!({"data": [
                {"search": {"description": "Search things", "inSchema": {"type": "object"}}},
                {"id": "lookup", "summary": "Look up"},
                {"description": "anonymous"},
                7
            ]}),
        )
        .expect("has array");
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search", "lookup", "tool_2"]);
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));
        assert_eq!(tools[1].description, "Look up");
        assert!(decode_rest_listing("api", &json!({"status": "ok"})).is_none());
    }

    #[test]
    fn declared_metadata_skips_unrecognizable_entries() {
        let tools = decode_declared(
            "cfg",
            &json!([{"name": "a", "description": "A"}, {"description": "no name"}, "b", 3]),
        );
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let tools = decode_declared("cfg", &json!({"x": {"description": "X"}, "y": "Y", "z": 1}));
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(tools[1].description, "Y");
    }

    #[test]
    fn serializes_with_camel_case_schema_key() {
        let t = DiscoveredTool {
            server: "s".into(),
            name: "n".into(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["inputSchema"]["type"], json!("object"));
    }
}
