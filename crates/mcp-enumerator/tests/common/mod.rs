//! Shared fixtures: the bundled stdio mock and an axum MCP endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_enumerator::mcp::strategy::RetryPolicy;
use mcp_enumerator::orchestrator::{EnumeratorSettings, Orchestrator};
use serde_json::{Value as JsonValue, json};

pub const SESSION: &str = "session-1";

pub fn mock_bin() -> &'static str {
    env!("CARGO_BIN_EXE_echo-tools-mock")
}

/// Waits up to two seconds for `pid` to exit. Zombies count as gone.
#[cfg(target_os = "linux")]
pub async fn process_gone(pid: &str) -> bool {
    let alive = || match std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) => false,
    };
    for _ in 0..40 {
        if !alive() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !alive()
}

/// Orchestrator with short backoffs so retry tests stay fast.
pub fn orchestrator() -> Orchestrator {
    Orchestrator::new(EnumeratorSettings {
        retry: RetryPolicy {
            http_max_retries: 2,
            http_backoff: Duration::from_millis(10),
            spawn_retries: 0,
        },
        shutdown_grace: Duration::from_millis(500),
        ..EnumeratorSettings::default()
    })
}

#[derive(Clone)]
struct McpState {
    tools: usize,
    sse: bool,
    failures_left: Arc<AtomicUsize>,
}

/// Streamable-HTTP endpoint at `/mcp` (JSON replies), `/sse` (event-stream
/// replies), `/flaky` (503 for the first `failures` posts), a REST-only
/// listing under `/legacy/tools` and a public info document under
/// `/bare/.well-known/mcp`.
pub fn mcp_router(tools: usize, failures: usize) -> Router {
    let plain = McpState {
        tools,
        sse: false,
        failures_left: Arc::new(AtomicUsize::new(0)),
    };
    let sse = McpState {
        sse: true,
        ..plain.clone()
    };
    let flaky = McpState {
        failures_left: Arc::new(AtomicUsize::new(failures)),
        ..plain.clone()
    };
    Router::new()
        .route("/mcp", post(mcp_endpoint).with_state(plain))
        .route("/sse", post(mcp_endpoint).with_state(sse))
        .route("/flaky", post(mcp_endpoint).with_state(flaky))
        .route("/legacy/tools", get(legacy_tools))
        .route("/bare/", get(|| async { Json(json!({"name": "bare", "version": "1"})) }))
        .route("/bare/.well-known/mcp", get(public_info))
}

pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

async fn mcp_endpoint(
    State(state): State<McpState>,
    headers: HeaderMap,
    Json(msg): Json<JsonValue>,
) -> Response {
    if state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response();
    }
    let method = msg["method"].as_str().unwrap_or_default().to_string();
    let Some(id) = msg.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "axum-mock", "version": "0.0.1"}
        }),
        "tools/list" => {
            if headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) != Some(SESSION) {
                return (StatusCode::BAD_REQUEST, "missing session").into_response();
            }
            let tools: Vec<JsonValue> = (0..state.tools)
                .map(|i| {
                    json!({
                        "name": format!("http_tool_{i}"),
                        "description": "served over http",
                        "inputSchema": {"type": "object"}
                    })
                })
                .collect();
            json!({"tools": tools})
        }
        other => {
            return Json(json!({"jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": format!("unknown method {other}")}}))
            .into_response();
        }
    };
    let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
    let mut resp = if state.sse {
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {reply}\n\n"),
        )
            .into_response()
    } else {
        Json(reply).into_response()
    };
    if method == "initialize" {
        resp.headers_mut()
            .insert("mcp-session-id", HeaderValue::from_static(SESSION));
    }
    resp
}

async fn legacy_tools() -> Json<JsonValue> {
    Json(json!({"tools": [
        {"name": "legacy_search", "description": "REST-listed tool"}
    ]}))
}

async fn public_info() -> Json<JsonValue> {
    Json(json!({"name": "bare", "tools": [
        {"info_lookup": {"description": "listed in public info"}}
    ]}))
}
