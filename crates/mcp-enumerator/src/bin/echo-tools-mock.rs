//! Scriptable stdio MCP server used by the integration tests.
//!
//! Flags: `--tools N`, `--page-size K`, `--hang` (never answer initialize),
//! `--error` (fail tools/list), `--noisy` (emit junk, a notification and a
//! server ping before answering), `--pid-file PATH`.

use serde_json::{Value as JsonValue, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug)]
struct Options {
    tools: usize,
    page_size: usize,
    hang: bool,
    error: bool,
    noisy: bool,
    pid_file: Option<String>,
}

fn parse_args() -> Result<Options, String> {
    let mut opts = Options {
        tools: 3,
        page_size: 0,
        hang: false,
        error: false,
        noisy: false,
        pid_file: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--tools" => opts.tools = number(args.next(), "--tools")?,
            "--page-size" => opts.page_size = number(args.next(), "--page-size")?,
            "--hang" => opts.hang = true,
            "--error" => opts.error = true,
            "--noisy" => opts.noisy = true,
            "--pid-file" => {
                opts.pid_file = Some(args.next().ok_or("--pid-file needs a path")?);
            }
            other => return Err(format!("unknown flag {other}")),
        }
    }
    Ok(opts)
}

fn number(value: Option<String>, flag: &str) -> Result<usize, String> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| format!("{flag} needs a number"))
}

fn tools_page(opts: &Options, cursor: Option<&str>) -> JsonValue {
    let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
    let end = if opts.page_size == 0 {
        opts.tools
    } else {
        (start + opts.page_size).min(opts.tools)
    };
    let tools: Vec<JsonValue> = (start..end)
        .map(|i| {
            json!({
                "name": format!("echo_{i}"),
                "description": format!("Echo tool number {i}"),
                "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
            })
        })
        .collect();
    if end < opts.tools {
        json!({"tools": tools, "nextCursor": end.to_string()})
    } else {
        json!({"tools": tools})
    }
}

async fn write_line(out: &mut tokio::io::Stdout, value: &str) -> std::io::Result<()> {
    out.write_all(value.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let opts = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("echo-tools-mock: {e}");
            std::process::exit(64);
        }
    };
    if let Some(path) = opts.pid_file.as_ref() {
        std::fs::write(path, std::process::id().to_string())?;
    }
    eprintln!("echo-tools-mock starting with {} tools", opts.tools);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Ok(msg) = serde_json::from_str::<JsonValue>(&line) else {
            eprintln!("echo-tools-mock: ignoring non-JSON input");
            continue;
        };
        let Some(method) = msg.get("method").and_then(JsonValue::as_str) else {
            // a response to one of our own requests
            continue;
        };
        let Some(id) = msg.get("id").cloned() else {
            continue;
        };

        let reply = match method {
            "initialize" => {
                if opts.hang {
                    continue;
                }
                if opts.noisy {
                    write_line(&mut out, "mock server warming up").await?;
                    write_line(
                        &mut out,
                        &json!({"jsonrpc": "2.0", "method": "notifications/message",
                                "params": {"level": "info", "data": "hello"}})
                        .to_string(),
                    )
                    .await?;
                    write_line(
                        &mut out,
                        &json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}).to_string(),
                    )
                    .await?;
                }
                json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "echo-tools-mock", "version": "0.1.0"}
                }})
            }
            "tools/list" if opts.error => json!({"jsonrpc": "2.0", "id": id,
                "error": {"code": -32603, "message": "tool registry unavailable"}}),
            "tools/list" => {
                let cursor = msg
                    .get("params")
                    .and_then(|p| p.get("cursor"))
                    .and_then(JsonValue::as_str);
                json!({"jsonrpc": "2.0", "id": id, "result": tools_page(&opts, cursor)})
            }
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            other => json!({"jsonrpc": "2.0", "id": id,
                "error": {"code": -32601, "message": format!("method not found: {other}")}}),
        };
        write_line(&mut out, &reply.to_string()).await?;
    }
    Ok(())
}
