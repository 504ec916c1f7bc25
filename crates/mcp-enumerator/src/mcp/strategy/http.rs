//! MCP discovery over streamable HTTP.
//!
//! `initialize`, `notifications/initialized` and paginated `tools/list` are
//! POSTed as JSON-RPC; replies may be plain JSON or an SSE stream. When the
//! endpoint does not speak JSON-RPC (404/405), a few conventional REST tool
//! listings and public info documents are tried before giving up.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value as JsonValue;
use tokio::time::{Instant, timeout_at};

use super::{ToolDiscovery, backoff_delay};
use crate::mcp::error::DiscoveryError;
use crate::mcp::jsonrpc::{self, Incoming, MAX_TOOL_PAGES};
use crate::mcp::tools::{DiscoveredTool, ToolListing, decode_rest_listing, decode_tools_page};
use crate::mcp::types::{ServerDescriptor, ServerTransport};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const ACCEPT_JSON_OR_SSE: &str = "application/json, text/event-stream";
const REST_LISTINGS: [&str; 4] = ["/tools", "/api/tools", "/v1/tools", "/mcp/tools"];
/// Only count when they actually list tools.
const PUBLIC_INFO: [&str; 4] = ["/", "/api/info", "/.well-known/mcp", "/info"];
/// Largest undelimited SSE event buffered while waiting for a reply.
const SSE_EVENT_LIMIT: usize = 4 * 1024 * 1024;
const CLOSE_BUDGET: Duration = Duration::from_millis(500);
const BODY_SNIPPET: usize = 200;

pub struct HttpDiscovery {
    client: Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpDiscovery {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            client: Client::new(),
            max_retries,
            backoff,
        }
    }

    /// First fallback endpoint that yields a tool listing, with its URL.
    async fn rest_listing(
        &self,
        server: &str,
        url: &str,
        headers: &HeaderMap,
        deadline: Instant,
    ) -> Option<(String, Vec<DiscoveredTool>)> {
        let base = url.trim_end_matches('/');
        let endpoints = REST_LISTINGS
            .iter()
            .map(|suffix| (*suffix, true))
            .chain(PUBLIC_INFO.iter().map(|suffix| (*suffix, false)));
        for (suffix, empty_ok) in endpoints {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let endpoint = format!("{base}{suffix}");
            let req = self
                .client
                .get(&endpoint)
                .headers(headers.clone())
                .header(ACCEPT, "application/json")
                .timeout(remaining);
            let resp = match timeout_at(deadline, req.send()).await {
                Ok(Ok(resp)) if resp.status().is_success() => resp,
                Ok(Ok(resp)) => {
                    tracing::debug!("{}: {} answered {}", server, endpoint, resp.status());
                    continue;
                }
                _ => continue,
            };
            let Ok(Ok(payload)) = timeout_at(deadline, resp.json::<JsonValue>()).await else {
                continue;
            };
            match decode_rest_listing(server, &payload) {
                Some(tools) if empty_ok || !tools.is_empty() => {
                    tracing::info!(
                        "{}: fallback listing {} returned {} tool(s)",
                        server,
                        endpoint,
                        tools.len()
                    );
                    return Some((endpoint, tools));
                }
                _ => {}
            }
        }
        None
    }
}

#[async_trait]
impl ToolDiscovery for HttpDiscovery {
    async fn discover(
        &self,
        server: &ServerDescriptor,
        deadline: Instant,
    ) -> Result<ToolListing, DiscoveryError> {
        let ServerTransport::Http { url, headers } = &server.transport else {
            return Err(DiscoveryError::Configuration(format!(
                "server {} declares no url",
                server.name
            )));
        };
        Url::parse(url)
            .map_err(|e| DiscoveryError::Configuration(format!("invalid url `{url}`: {e}")))?;
        let headers = header_map(headers)?;

        let mut session = HttpSession {
            client: &self.client,
            server: &server.name,
            url,
            headers: headers.clone(),
            session_id: None,
            protocol_version: None,
            next_id: 1,
            max_retries: self.max_retries,
            backoff: self.backoff,
            deadline,
        };
        let outcome = session.list_tools().await;
        session.close().await;

        match outcome {
            Ok(listing) => Ok(listing),
            Err(failure)
                if matches!(
                    failure.status,
                    Some(StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED)
                ) =>
            {
                tracing::debug!(
                    "{}: JSON-RPC endpoint unavailable ({}); trying fallback listings",
                    server.name,
                    failure.error
                );
                match self.rest_listing(&server.name, url, &headers, deadline).await {
                    Some((endpoint, tools)) => {
                        let mut listing = ToolListing::new(tools);
                        listing.warn(format!(
                            "JSON-RPC endpoint unavailable ({}); tools read from {endpoint}",
                            failure.error
                        ));
                        Ok(listing)
                    }
                    None => Err(failure.error),
                }
            }
            Err(failure) => Err(failure.error),
        }
    }
}

/// A failed exchange, classified for the retry loop.
#[derive(Debug)]
struct Failure {
    error: DiscoveryError,
    retryable: bool,
    status: Option<StatusCode>,
}

impl Failure {
    fn permanent(error: DiscoveryError) -> Self {
        Self {
            error,
            retryable: false,
            status: None,
        }
    }

    fn transient(error: DiscoveryError) -> Self {
        Self {
            error,
            retryable: true,
            status: None,
        }
    }
}

struct HttpSession<'a> {
    client: &'a Client,
    server: &'a str,
    url: &'a str,
    headers: HeaderMap,
    session_id: Option<HeaderValue>,
    protocol_version: Option<HeaderValue>,
    next_id: u64,
    max_retries: u32,
    backoff: Duration,
    deadline: Instant,
}

impl HttpSession<'_> {
    async fn list_tools(&mut self) -> Result<ToolListing, Failure> {
        let params = jsonrpc::initialize_params().map_err(Failure::permanent)?;
        let init = self.call("initialize", Some(params)).await?;
        if let Some(v) = init.get("protocolVersion").and_then(|v| v.as_str()) {
            self.protocol_version = HeaderValue::from_str(v).ok();
        }
        tracing::debug!(
            "{} initialized over http (session={})",
            self.server,
            self.session_id.is_some()
        );
        self.notify("notifications/initialized").await;

        let mut listing = ToolListing::default();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let result = self
                .call("tools/list", jsonrpc::list_tools_params(cursor.as_deref()))
                .await?;
            let page = decode_tools_page(self.server, &result).map_err(Failure::permanent)?;
            listing.tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(listing),
            }
        }
        tracing::warn!(
            "{}: stopped after {} tools/list pages",
            self.server,
            MAX_TOOL_PAGES
        );
        listing.warn(format!("Stopped after {MAX_TOOL_PAGES} tools/list pages"));
        Ok(listing)
    }

    /// One JSON-RPC request with retries for transient failures.
    async fn call(
        &mut self,
        method: &'static str,
        params: Option<JsonValue>,
    ) -> Result<JsonValue, Failure> {
        let id = self.next_id;
        self.next_id += 1;
        let body = jsonrpc::request(id, method, params);
        let mut attempt = 0;
        loop {
            match self.post(&body, Some(id), method).await {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {
                    return Err(Failure::permanent(DiscoveryError::MalformedResponse(
                        format!("empty reply to {method}"),
                    )));
                }
                Err(failure) if failure.retryable && attempt < self.max_retries => {
                    let Some(delay) = backoff_delay(self.backoff, attempt, self.deadline) else {
                        return Err(failure);
                    };
                    attempt += 1;
                    tracing::debug!(
                        "{}: {} failed ({}); retry {} in {:?}",
                        self.server,
                        method,
                        failure.error,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn notify(&mut self, method: &'static str) {
        let body = jsonrpc::notification(method);
        if let Err(failure) = self.post(&body, None, method).await {
            tracing::debug!(
                "{}: {} not accepted: {}",
                self.server,
                method,
                failure.error
            );
        }
    }

    /// POST one message. Returns the correlated result for requests, `None`
    /// for accepted notifications.
    async fn post(
        &mut self,
        body: &JsonValue,
        id: Option<u64>,
        phase: &'static str,
    ) -> Result<Option<JsonValue>, Failure> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Failure::permanent(DiscoveryError::timeout(phase)));
        }
        let mut req = self
            .client
            .post(self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_JSON_OR_SSE)
            .timeout(remaining)
            .json(body);
        if let Some(sid) = &self.session_id {
            req = req.header(SESSION_HEADER, sid.clone());
        }
        if let Some(version) = &self.protocol_version {
            req = req.header(PROTOCOL_HEADER, version.clone());
        }

        let sent = timeout_at(self.deadline, req.send()).await;
        let resp = match sent {
            Err(_) => return Err(Failure::transient(DiscoveryError::timeout(phase))),
            Ok(Err(e)) => return Err(transport_failure(&e, phase)),
            Ok(Ok(resp)) => resp,
        };
        if let Some(sid) = resp.headers().get(SESSION_HEADER) {
            self.session_id = Some(sid.clone());
        }

        let status = resp.status();
        if !status.is_success() {
            let text = timeout_at(self.deadline, resp.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(status_failure(status, &text));
        }
        let Some(id) = id else {
            return Ok(None);
        };

        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let payload = if is_sse {
            timeout_at(self.deadline, read_sse(resp, id)).await
        } else {
            timeout_at(self.deadline, read_json(resp)).await
        };
        let payload = match payload {
            Err(_) => return Err(Failure::transient(DiscoveryError::timeout(phase))),
            Ok(Err(e)) => return Err(Failure::permanent(e)),
            Ok(Ok(v)) => v,
        };

        match jsonrpc::classify(payload) {
            Ok(Incoming::Response { id: got, outcome }) if jsonrpc::id_matches(&got, id) => {
                outcome
                    .map(Some)
                    .map_err(|f| Failure::permanent(DiscoveryError::from(f)))
            }
            Ok(_) => Err(Failure::permanent(DiscoveryError::MalformedResponse(
                format!("no response to {phase} request {id}"),
            ))),
            Err(e) => Err(Failure::permanent(DiscoveryError::MalformedResponse(
                e.to_string(),
            ))),
        }
    }

    /// Best-effort session termination.
    async fn close(&self) {
        let Some(sid) = &self.session_id else {
            return;
        };
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let budget = remaining.min(CLOSE_BUDGET);
        if budget.is_zero() {
            return;
        }
        let req = self
            .client
            .delete(self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, sid.clone())
            .timeout(budget);
        if let Err(e) = req.send().await {
            tracing::debug!("{}: session close failed: {}", self.server, e);
        }
    }
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, DiscoveryError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| DiscoveryError::Configuration(format!("invalid header name `{k}`: {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| DiscoveryError::Configuration(format!("invalid value for `{k}`: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn transport_failure(e: &reqwest::Error, phase: &'static str) -> Failure {
    if e.is_timeout() {
        return Failure::transient(DiscoveryError::timeout(phase));
    }
    let error = DiscoveryError::ConnectionFailure(error_chain(e));
    if e.is_connect() || e.is_request() {
        Failure::transient(error)
    } else {
        Failure::permanent(error)
    }
}

fn status_failure(status: StatusCode, body: &str) -> Failure {
    let snippet: String = body.trim().chars().take(BODY_SNIPPET).collect();
    let message = if snippet.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {snippet}")
    };
    Failure {
        error: DiscoveryError::upstream(Some(i64::from(status.as_u16())), message),
        retryable: status.is_server_error(),
        status: Some(status),
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

async fn read_json(resp: Response) -> Result<JsonValue, DiscoveryError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| DiscoveryError::ConnectionFailure(error_chain(&e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DiscoveryError::MalformedResponse(format!("invalid JSON body: {e}")))
}

/// Read SSE events until the one answering `id` arrives.
async fn read_sse(resp: Response, id: u64) -> Result<JsonValue, DiscoveryError> {
    let mut stream = resp.bytes_stream();
    let mut events = SseBuffer::new(id, SSE_EVENT_LIMIT);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DiscoveryError::ConnectionFailure(error_chain(&e)))?;
        if let Some(msg) = events.push(&chunk)? {
            return Ok(msg);
        }
    }
    events.finish().ok_or_else(|| {
        DiscoveryError::MalformedResponse("event stream ended without a response".to_string())
    })
}

/// Splits an event stream into events, holding at most `limit` bytes of the
/// event still in progress.
struct SseBuffer {
    id: u64,
    limit: usize,
    buf: Vec<u8>,
}

impl SseBuffer {
    fn new(id: u64, limit: usize) -> Self {
        Self {
            id,
            limit,
            buf: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<Option<JsonValue>, DiscoveryError> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        while let Some(end) = event_end(&self.buf) {
            let event: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(msg) = sse_response(&event, self.id) {
                return Ok(Some(msg));
            }
        }
        if self.buf.len() > self.limit {
            return Err(DiscoveryError::MalformedResponse(format!(
                "event stream event exceeds {} bytes",
                self.limit
            )));
        }
        Ok(None)
    }

    fn finish(self) -> Option<JsonValue> {
        sse_response(&self.buf, self.id)
    }
}

fn event_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// JSON-RPC payload of one SSE event, if it is the response to `id`.
fn sse_response(event: &[u8], id: u64) -> Option<JsonValue> {
    let text = String::from_utf8_lossy(event);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if data.is_empty() {
        return None;
    }
    let value: JsonValue = serde_json::from_str(&data.join("\n")).ok()?;
    let is_response = value.get("method").is_none()
        && value.get("id").is_some_and(|v| jsonrpc::id_matches(v, id));
    is_response.then_some(value)
}
