//! JSON-RPC 2.0 framing shared by the HTTP and stdio strategies.

use rust_mcp_sdk::schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, LATEST_PROTOCOL_VERSION,
};
use serde_json::{Value as JsonValue, json};

use super::error::DiscoveryError;

pub const METHOD_NOT_FOUND: i64 = -32601;

pub const CLIENT_NAME: &str = "mcp-enumerator";

/// Upper bound on `tools/list` pages followed per server.
pub const MAX_TOOL_PAGES: usize = 32;

pub fn request(id: u64, method: &str, params: Option<JsonValue>) -> JsonValue {
    match params {
        Some(params) => json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
        None => json!({"jsonrpc": "2.0", "id": id, "method": method}),
    }
}

pub fn notification(method: &str) -> JsonValue {
    json!({"jsonrpc": "2.0", "method": method})
}

pub fn result_response(id: JsonValue, result: JsonValue) -> JsonValue {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn error_response(id: JsonValue, code: i64, message: &str) -> JsonValue {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// `initialize` params advertising this client.
pub fn initialize_params() -> Result<JsonValue, DiscoveryError> {
    let params = InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: CLIENT_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
        },
        protocol_version: LATEST_PROTOCOL_VERSION.into(),
    };
    serde_json::to_value(params)
        .map_err(|e| DiscoveryError::Internal(format!("encode initialize params: {e}")))
}

/// `tools/list` params, carrying the pagination cursor when present.
pub fn list_tools_params(cursor: Option<&str>) -> Option<JsonValue> {
    cursor.map(|c| json!({ "cursor": c }))
}

/// Inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: JsonValue,
        outcome: Result<JsonValue, RpcFailure>,
    },
    Request {
        id: JsonValue,
        method: String,
    },
    Notification {
        method: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcFailure {
    pub code: Option<i64>,
    pub message: String,
}

impl From<RpcFailure> for DiscoveryError {
    fn from(f: RpcFailure) -> Self {
        DiscoveryError::upstream(f.code, f.message)
    }
}

/// Sort a decoded JSON value into response / request / notification.
pub fn classify(msg: JsonValue) -> Result<Incoming, DiscoveryError> {
    let JsonValue::Object(mut obj) = msg else {
        return Err(DiscoveryError::protocol("message is not a JSON object"));
    };
    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let id = obj.remove("id").filter(|id| !id.is_null());

    match (method, id) {
        (Some(method), Some(id)) => Ok(Incoming::Request { id, method }),
        (Some(method), None) => Ok(Incoming::Notification { method }),
        (None, Some(id)) => {
            if let Some(err) = obj.remove("error") {
                let code = err.get("code").and_then(|c| c.as_i64());
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                Ok(Incoming::Response {
                    id,
                    outcome: Err(RpcFailure { code, message }),
                })
            } else if let Some(result) = obj.remove("result") {
                Ok(Incoming::Response {
                    id,
                    outcome: Ok(result),
                })
            } else {
                Err(DiscoveryError::protocol(
                    "response carries neither result nor error",
                ))
            }
        }
        (None, None) => Err(DiscoveryError::protocol(
            "message is neither a request, a notification nor a response",
        )),
    }
}

/// True when a response id refers to the numeric request id we sent.
pub fn id_matches(id: &JsonValue, expected: u64) -> bool {
    match id {
        JsonValue::Number(n) => n.as_u64() == Some(expected),
        JsonValue::String(s) => s.parse::<u64>().ok() == Some(expected),
        _ => false,
    }
}

/// Build the answer to a server-initiated request.
pub fn answer_server_request(id: JsonValue, method: &str) -> JsonValue {
    if method == "ping" {
        result_response(id, json!({}))
    } else {
        error_response(id, METHOD_NOT_FOUND, &format!("method not supported: {method}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_result_and_error_responses() {
        let ok = classify(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})).unwrap();
        assert_eq!(
            ok,
            Incoming::Response {
                id: json!(1),
                outcome: Ok(json!({"tools": []}))
            }
        );
        let err = classify(json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32000, "message": "nope"}}))
            .unwrap();
        match err {
            Incoming::Response { outcome: Err(f), .. } => {
                assert_eq!(f.code, Some(-32000));
                assert_eq!(f.message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_requests_and_notifications() {
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "id": "a", "method": "ping"})).unwrap(),
            Incoming::Request {
                id: json!("a"),
                method: "ping".into()
            }
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "method": "notifications/message"})).unwrap(),
            Incoming::Notification {
                method: "notifications/message".into()
            }
        );
    }

    #[test]
    fn rejects_shapeless_messages() {
        assert!(classify(json!({"jsonrpc": "2.0"})).is_err());
        assert!(classify(json!([1, 2])).is_err());
        assert!(classify(json!({"jsonrpc": "2.0", "id": 3})).is_err());
    }

    #[test]
    fn ping_is_answered_and_others_refused() {
        let pong = answer_server_request(json!(9), "ping");
        assert_eq!(pong["result"], json!({}));
        let refused = answer_server_request(json!(10), "sampling/createMessage");
        assert_eq!(refused["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[test]
    fn initialize_params_name_this_client() {
        let p = initialize_params().unwrap();
        assert_eq!(p["clientInfo"]["name"], json!(CLIENT_NAME));
        assert_eq!(p["protocolVersion"], json!(LATEST_PROTOCOL_VERSION));
    }

    #[test]
    fn id_matching_accepts_numeric_strings() {
        assert!(id_matches(&json!(4), 4));
        assert!(id_matches(&json!("4"), 4));
        assert!(!id_matches(&json!(5), 4));
        assert!(!id_matches(&json!(null), 4));
    }
}
