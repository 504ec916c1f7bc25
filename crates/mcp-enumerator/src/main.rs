use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use env_flags::env_flags;
use once_cell::sync::OnceCell;
use rust_mcp_sdk::error::SdkResult;
use rust_mcp_sdk::mcp_server::{
    HyperServerOptions, ServerRuntime, hyper_server_core, server_runtime_core,
};
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, LATEST_PROTOCOL_VERSION, ServerCapabilities,
    ServerCapabilitiesTools,
};
use rust_mcp_sdk::{McpServer, StdioTransport, TransportOptions};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use mcp_enumerator::config::{UserConfig, load_user_config, resolve_home};
use mcp_enumerator::handler::EnumeratorServerHandler;
use mcp_enumerator::mcp::strategy::RetryPolicy;
use mcp_enumerator::orchestrator::{EnumeratorSettings, Orchestrator};
use mcp_enumerator::report::{Envelope, StatusPolicy};
use mcp_enumerator::request::EnumerationRequest;

const LOG_FILE: &str = "mcp-enumerator.log";

#[derive(Clone, Copy)]
enum LogStyle {
    Json,
    Compact,
    Pretty,
    Full,
}

fn fmt_layer<W>(writer: W, style: LogStyle, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(writer);
    match style {
        LogStyle::Json => base.json().boxed(),
        LogStyle::Compact => base.compact().boxed(),
        LogStyle::Pretty => base.pretty().boxed(),
        LogStyle::Full => base.boxed(),
    }
}

fn init_tracing(home: &Path, user_cfg: Option<&UserConfig>) {
    env_flags! {
        /// Tracing filter, e.g. "info", "debug", or targets format.
        RUST_LOG: &str = "info";
        /// Preferred filter env (alias). If set, overrides RUST_LOG.
        TRACING_FILTER: &str = "";
        /// Pretty formatting for logs (ignored if TRACING_JSON=true).
        TRACING_PRETTY: bool = false;
        /// Compact single-line formatting for logs (ignored if TRACING_JSON=true)
        TRACING_COMPACT: bool = true;
        /// JSON formatting for logs
        TRACING_JSON: bool = false;
        /// If true, also log to file under <ENUMERATOR_HOME>/logs or LOG_DIR
        LOG_TO_FILE: bool = true;
        /// Optional explicit log directory (absolute). Defaults to <ENUMERATOR_HOME>/logs
        LOG_DIR: &str = "";
    }

    let env_set = |k: &str| std::env::var_os(k).is_some();

    let mut rust_log = if !(*TRACING_FILTER).is_empty() {
        (*TRACING_FILTER).to_string()
    } else {
        (*RUST_LOG).to_string()
    };
    let mut tracing_json = *TRACING_JSON;
    let mut tracing_compact = *TRACING_COMPACT;
    let mut tracing_pretty = *TRACING_PRETTY;
    let mut log_to_file = *LOG_TO_FILE;
    let mut log_dir: Option<PathBuf> = if !(*LOG_DIR).is_empty() {
        Some(PathBuf::from((*LOG_DIR).to_string()))
    } else {
        None
    };

    if let Some(cfg) = user_cfg.and_then(|c| c.logging.as_ref()) {
        if !(env_set("TRACING_FILTER") || env_set("RUST_LOG"))
            && let Some(level) = cfg.level.as_ref()
        {
            rust_log = level.clone();
        }
        if !env_set("TRACING_JSON")
            && let Some(v) = cfg.json
        {
            tracing_json = v;
        }
        if !env_set("TRACING_COMPACT")
            && let Some(v) = cfg.compact
        {
            tracing_compact = v;
        }
        if !env_set("TRACING_PRETTY")
            && let Some(v) = cfg.pretty
        {
            tracing_pretty = v;
        }
        if !env_set("LOG_TO_FILE")
            && let Some(v) = cfg.to_file
        {
            log_to_file = v;
        }
        if !env_set("LOG_DIR")
            && let Some(dir) = cfg.dir.as_ref()
        {
            log_dir = Some(mcp_enumerator::config::expand_home(dir));
        }
    }

    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));
    let style = if tracing_json {
        LogStyle::Json
    } else if tracing_compact {
        LogStyle::Compact
    } else if tracing_pretty {
        LogStyle::Pretty
    } else {
        LogStyle::Full
    };

    // Logs always go to stderr: stdout carries JSON-RPC in stdio mode.
    let mut layers = vec![fmt_layer(std::io::stderr, style, true)];
    let mut dir_error = None;
    static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
    if log_to_file {
        let dir = log_dir.unwrap_or_else(|| home.join("logs"));
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
                let (nb, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                layers.push(fmt_layer(nb, style, false));
            }
            Err(e) => dir_error = Some((dir, e)),
        }
    }

    if let Err(e) = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
    {
        eprintln!("tracing already set: {e:?}");
    }
    if let Some((dir, e)) = dir_error {
        tracing::warn!("failed to create log dir {}: {}", dir.display(), e);
    }
}

/// Orchestrator settings: env var > `[enumerator]` table > default.
fn resolve_settings(user_cfg: Option<&UserConfig>) -> EnumeratorSettings {
    env_flags! {
        /// Default per-server timeout when an entry declares none
        ENUMERATOR_SERVER_TIMEOUT_SECS: u64 = 30;
        /// Maximum servers discovered at once
        ENUMERATOR_MAX_CONCURRENCY: usize = 16;
        /// Maximum servers accepted per request
        ENUMERATOR_MAX_SERVERS: usize = 64;
        /// Retries for transient HTTP failures (5xx, connect errors, timeouts)
        ENUMERATOR_HTTP_MAX_RETRIES: u32 = 2;
        /// Base HTTP backoff in milliseconds; doubles per attempt
        ENUMERATOR_HTTP_BACKOFF_MS: u64 = 250;
        /// Retries for transient spawn failures
        ENUMERATOR_SPAWN_RETRIES: u32 = 1;
        /// Overall status policy: "all" or "any"
        ENUMERATOR_STATUS_POLICY: &str = "all";
        /// Cleanup grace after a deadline before tasks are aborted
        ENUMERATOR_SHUTDOWN_GRACE_MS: u64 = 1500;
    }

    let env_set = |k: &str| std::env::var_os(k).is_some();
    let cfg = user_cfg.and_then(|c| c.enumerator.as_ref());
    let pick = |key: &str, env: u64, from_cfg: Option<u64>| {
        if env_set(key) {
            env
        } else {
            from_cfg.unwrap_or(env)
        }
    };

    let status_policy = if env_set("ENUMERATOR_STATUS_POLICY") {
        (*ENUMERATOR_STATUS_POLICY)
            .parse::<StatusPolicy>()
            .unwrap_or_else(|e| {
                tracing::warn!("{}; using default", e);
                StatusPolicy::default()
            })
    } else {
        cfg.and_then(|c| c.status_policy).unwrap_or_default()
    };
    let max_concurrency = if env_set("ENUMERATOR_MAX_CONCURRENCY") {
        *ENUMERATOR_MAX_CONCURRENCY
    } else {
        cfg.and_then(|c| c.max_concurrency)
            .unwrap_or(*ENUMERATOR_MAX_CONCURRENCY)
    };
    let max_servers = if env_set("ENUMERATOR_MAX_SERVERS") {
        *ENUMERATOR_MAX_SERVERS
    } else {
        cfg.and_then(|c| c.max_servers).unwrap_or(*ENUMERATOR_MAX_SERVERS)
    };
    let http_max_retries = if env_set("ENUMERATOR_HTTP_MAX_RETRIES") {
        *ENUMERATOR_HTTP_MAX_RETRIES
    } else {
        cfg.and_then(|c| c.http_max_retries)
            .unwrap_or(*ENUMERATOR_HTTP_MAX_RETRIES)
    };
    let spawn_retries = if env_set("ENUMERATOR_SPAWN_RETRIES") {
        *ENUMERATOR_SPAWN_RETRIES
    } else {
        cfg.and_then(|c| c.spawn_retries)
            .unwrap_or(*ENUMERATOR_SPAWN_RETRIES)
    };

    EnumeratorSettings {
        server_timeout: Duration::from_secs(pick(
            "ENUMERATOR_SERVER_TIMEOUT_SECS",
            *ENUMERATOR_SERVER_TIMEOUT_SECS,
            cfg.and_then(|c| c.server_timeout_secs),
        )),
        max_concurrency: max_concurrency.max(1),
        max_servers,
        retry: RetryPolicy {
            http_max_retries,
            http_backoff: Duration::from_millis(pick(
                "ENUMERATOR_HTTP_BACKOFF_MS",
                *ENUMERATOR_HTTP_BACKOFF_MS,
                cfg.and_then(|c| c.http_backoff_ms),
            )),
            spawn_retries,
        },
        status_policy,
        shutdown_grace: Duration::from_millis(pick(
            "ENUMERATOR_SHUTDOWN_GRACE_MS",
            *ENUMERATOR_SHUTDOWN_GRACE_MS,
            cfg.and_then(|c| c.shutdown_grace_ms),
        )),
    }
}

/// Read one request file, run it, print the envelope.
async fn run_once(orchestrator: &Orchestrator, input: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("read request {}", input.display()))?;
    let request = EnumerationRequest::from_document(&text)
        .with_context(|| format!("parse request {}", input.display()))?;
    let report = orchestrator
        .enumerate(&request)
        .await
        .context("request rejected")?;
    let out = serde_json::to_string_pretty(&Envelope::from(report))
        .context("serialize envelope")?;
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> SdkResult<()> {
    env_flags! {
        /// Enumerator home directory (absolute). Defaults to $HOME/.mcp-enumerator
        ENUMERATOR_HOME: &str = "";
        /// Transport: "stdio" (default) or "http"
        TRANSPORT: &str = "stdio";
        /// Host for HTTP transport
        HOST: &str = "127.0.0.1";
        /// Port for HTTP transport
        PORT: u16 = 8081;
        /// Ping interval for HTTP SSE
        PING_SECS: u64 = 5;
        /// Enable JSON response mode for HTTP
        HTTP_JSON: bool = false;
        /// One-shot mode: path to a JSON or YAML request; prints the envelope and exits
        ENUMERATOR_INPUT: &str = "";
    }

    let home = resolve_home(*ENUMERATOR_HOME);
    let (user_cfg, cfg_error) = match load_user_config(&home) {
        Ok(cfg) => (cfg, None),
        Err(e) => (None, Some(e)),
    };
    init_tracing(&home, user_cfg.as_ref());
    if let Some(e) = cfg_error {
        tracing::warn!("ignoring user config: {:#}", e);
    }

    let settings = resolve_settings(user_cfg.as_ref());
    tracing::debug!(?settings, "resolved settings");
    let orchestrator = Arc::new(Orchestrator::new(settings));

    if !(*ENUMERATOR_INPUT).is_empty() {
        let input = mcp_enumerator::config::expand_home(*ENUMERATOR_INPUT);
        if let Err(e) = run_once(&orchestrator, &input).await {
            tracing::error!("one-shot enumeration failed: {:#}", e);
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
        return Ok(());
    }

    let env_set = |k: &str| std::env::var_os(k).is_some();
    let service = user_cfg.as_ref().and_then(|c| c.enumerator.as_ref());
    let transport = if env_set("TRANSPORT") {
        (*TRANSPORT).to_string()
    } else {
        service
            .and_then(|s| s.transport.clone())
            .unwrap_or_else(|| (*TRANSPORT).to_string())
    };
    let host = if env_set("HOST") {
        (*HOST).to_string()
    } else {
        service
            .and_then(|s| s.host.clone())
            .unwrap_or_else(|| (*HOST).to_string())
    };
    let port = if env_set("PORT") {
        *PORT
    } else {
        service.and_then(|s| s.port).unwrap_or(*PORT)
    };

    tracing::info!("starting mcp-enumerator (transport={})", transport);

    let server_details = InitializeResult {
        server_info: Implementation {
            name: "mcp-enumerator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("MCP Tool Enumerator".to_string()),
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: Some(
            "Call enumerate_tools with { mcp_json: { mcpServers: {...} } } to list every server's tools."
                .to_string(),
        ),
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    };

    let handler = EnumeratorServerHandler::new(orchestrator);

    if transport == "stdio" {
        let transport = StdioTransport::new(TransportOptions::default())?;
        let server: ServerRuntime =
            server_runtime_core::create_server(server_details, transport, handler);
        tracing::info!("starting stdio server");
        if let Err(e) = server.start().await {
            let msg = match e.rpc_error_message() {
                Some(m) => m.to_string(),
                None => e.to_string(),
            };
            tracing::error!("server runtime error: {}", msg);
        }
    } else {
        let ping = Duration::from_secs(*PING_SECS);
        let server = hyper_server_core::create_server(
            server_details,
            handler,
            HyperServerOptions {
                host: host.clone(),
                port,
                ping_interval: ping,
                enable_json_response: Some(*HTTP_JSON),
                ..Default::default()
            },
        );
        tracing::info!(
            "http server configured; starting listener on {}:{} (json={}, ping_secs={})",
            host,
            port,
            *HTTP_JSON,
            *PING_SECS
        );
        if let Err(e) = server.start().await {
            let msg = match e.rpc_error_message() {
                Some(m) => m.to_string(),
                None => e.to_string(),
            };
            tracing::error!("hyper server error: {}", msg);
        }
    }
    tracing::info!("server stopped");
    Ok(())
}
