//! STDIO introspection: launch the server, run the handshake over its
//! stdin/stdout, list tools, then tear the process down.
//!
//! The child is always owned by a [`StdioSession`] and runs in its own process
//! group, so launchers such as `npx` take the real server down with them.
//! Normal exits go through [`StdioSession::shutdown`], which kills the group
//! and reaps the child; if the surrounding task is cancelled instead, the
//! session's `Drop` kills the group and `kill_on_drop` handles the child.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};

use super::{ToolDiscovery, backoff_delay};
use crate::mcp::error::DiscoveryError;
use crate::mcp::jsonrpc::{self, Incoming, MAX_TOOL_PAGES};
use crate::mcp::tools::{ToolListing, decode_tools_page};
use crate::mcp::types::{ServerDescriptor, ServerTransport};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Bytes of child stderr kept for diagnostics (the tail is kept).
const STDERR_LIMIT: usize = 4096;
/// Longest stdout line considered; longer lines are discarded as noise.
const STDOUT_LINE_LIMIT: usize = 16 * 1024 * 1024;
const SPAWN_BACKOFF: Duration = Duration::from_millis(100);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
const STDERR_SETTLE: Duration = Duration::from_millis(200);

/// Package runners that do nothing useful without a package argument.
const LAUNCHERS: [&str; 3] = ["npx", "uvx", "uv"];

pub struct StdioDiscovery {
    spawn_retries: u32,
}

impl StdioDiscovery {
    pub fn new(spawn_retries: u32) -> Self {
        Self { spawn_retries }
    }

    async fn spawn_with_retry(
        &self,
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        deadline: Instant,
    ) -> Result<StdioSession, DiscoveryError> {
        let mut attempt = 0;
        loop {
            if Instant::now() >= deadline {
                return Err(DiscoveryError::timeout("spawn"));
            }
            let err = match StdioSession::spawn(server, command, args, env) {
                Ok(session) => return Ok(session),
                Err(e) => e,
            };
            let permanent = matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            );
            let failure = DiscoveryError::ProcessFailure {
                message: format!("failed to start `{command}`: {err}"),
                stderr: None,
            };
            if permanent || attempt >= self.spawn_retries {
                return Err(failure);
            }
            let Some(delay) = backoff_delay(SPAWN_BACKOFF, attempt, deadline) else {
                return Err(failure);
            };
            tracing::debug!(
                "spawn of {} failed ({}); retrying in {:?}",
                server,
                err,
                delay
            );
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ToolDiscovery for StdioDiscovery {
    async fn discover(
        &self,
        server: &ServerDescriptor,
        deadline: Instant,
    ) -> Result<ToolListing, DiscoveryError> {
        let ServerTransport::Stdio { command, args, env } = &server.transport else {
            return Err(DiscoveryError::Configuration(format!(
                "server {} declares no command",
                server.name
            )));
        };
        check_launcher(command, args)?;

        let mut session = self
            .spawn_with_retry(&server.name, command, args, env, deadline)
            .await?;
        tracing::debug!(
            "spawned {} (pid={:?}): {} {}",
            server.name,
            session.child.id(),
            command,
            args.join(" ")
        );
        let result = session.enumerate(deadline).await;
        let stderr = session.shutdown().await;
        match result {
            Ok(mut listing) => {
                if let Some(s) = stderr.as_deref().filter(|s| !s.trim().is_empty()) {
                    tracing::trace!("{} stderr:\n{}", server.name, s);
                }
                if session.noise_lines > 0 {
                    listing.warn(format!(
                        "Ignored {} non-JSON stdout line(s)",
                        session.noise_lines
                    ));
                }
                Ok(listing)
            }
            Err(e) => Err(e.with_stderr(stderr)),
        }
    }
}

/// Reject bare package launchers before anything is spawned.
fn check_launcher(command: &str, args: &[String]) -> Result<(), DiscoveryError> {
    let base = std::path::Path::new(command)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(command)
        .to_ascii_lowercase();
    if LAUNCHERS.contains(&base.as_str()) && args.iter().all(|a| a.trim().is_empty()) {
        return Err(DiscoveryError::Configuration(format!(
            "`{command}` requires a package argument"
        )));
    }
    Ok(())
}

/// A running server process plus the pipes used to talk to it.
struct StdioSession {
    server: String,
    child: Child,
    group: ProcessGroup,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Arc<Mutex<String>>,
    drain: Option<JoinHandle<()>>,
    noise_lines: usize,
}

impl StdioSession {
    fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> std::io::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn()?;
        let group = ProcessGroup::of(&child);

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(std::io::Error::other("child pipes were not captured"));
        };

        let buffer = Arc::new(Mutex::new(String::new()));
        let drain = tokio::spawn(drain_stderr(stderr, Arc::clone(&buffer)));
        Ok(Self {
            server: server.to_string(),
            child,
            group,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr: buffer,
            drain: Some(drain),
            noise_lines: 0,
        })
    }

    async fn enumerate(&mut self, deadline: Instant) -> Result<ToolListing, DiscoveryError> {
        let init = self
            .request("initialize", Some(jsonrpc::initialize_params()?), deadline)
            .await?;
        tracing::debug!(
            "{} initialized (protocol={})",
            self.server,
            init.get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
        );
        self.send(&jsonrpc::notification("notifications/initialized"), deadline, "initialize")
            .await?;

        let mut listing = ToolListing::default();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let result = self
                .request("tools/list", jsonrpc::list_tools_params(cursor.as_deref()), deadline)
                .await?;
            let page = decode_tools_page(&self.server, &result)?;
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

    /// Send one request and wait for its correlated response.
    async fn request(
        &mut self,
        method: &'static str,
        params: Option<JsonValue>,
        deadline: Instant,
    ) -> Result<JsonValue, DiscoveryError> {
        let id = next_request_id();
        self.send(&jsonrpc::request(id, method, params), deadline, method)
            .await?;
        let mut line = Vec::new();
        loop {
            let next = timeout_at(
                deadline,
                read_line_capped(&mut self.stdout, &mut line, STDOUT_LINE_LIMIT),
            )
            .await;
            match next {
                Err(_) => return Err(DiscoveryError::timeout(method)),
                Ok(Err(e)) => {
                    return Err(DiscoveryError::ProcessFailure {
                        message: format!("reading stdout during {method}: {e}"),
                        stderr: None,
                    });
                }
                Ok(Ok(None)) => return Err(self.exited(method)),
                Ok(Ok(Some(LineRead::Oversized))) => {
                    tracing::debug!("{}: discarding oversized stdout line", self.server);
                    self.noise_lines += 1;
                    continue;
                }
                Ok(Ok(Some(LineRead::Complete))) => {}
            }
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(msg) = serde_json::from_slice::<JsonValue>(trimmed) else {
                tracing::debug!("{}: skipping non-JSON stdout line", self.server);
                self.noise_lines += 1;
                continue;
            };
            match jsonrpc::classify(msg)? {
                Incoming::Response { id: got, outcome } => {
                    if !jsonrpc::id_matches(&got, id) {
                        return Err(DiscoveryError::protocol(format!(
                            "response id {got} does not match request {id} ({method})"
                        )));
                    }
                    return outcome.map_err(DiscoveryError::from);
                }
                Incoming::Request { id: rid, method: m } => {
                    tracing::debug!("{}: answering server request {}", self.server, m);
                    let reply = jsonrpc::answer_server_request(rid, &m);
                    self.send(&reply, deadline, method).await?;
                }
                Incoming::Notification { method: m } => {
                    tracing::debug!("{}: ignoring notification {}", self.server, m);
                }
            }
        }
    }

    async fn send(
        &mut self,
        msg: &JsonValue,
        deadline: Instant,
        phase: &'static str,
    ) -> Result<(), DiscoveryError> {
        let mut line = msg.to_string();
        line.push('\n');
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(DiscoveryError::ProcessFailure {
                message: "stdin already closed".to_string(),
                stderr: None,
            });
        };
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        match timeout_at(deadline, write).await {
            Err(_) => Err(DiscoveryError::timeout(phase)),
            Ok(Err(e)) => Err(DiscoveryError::ProcessFailure {
                message: format!("writing {phase} to stdin: {e}"),
                stderr: None,
            }),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn exited(&mut self, phase: &str) -> DiscoveryError {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            _ => "stdout closed".to_string(),
        };
        DiscoveryError::ProcessFailure {
            message: format!("server exited before completing {phase} ({status})"),
            stderr: None,
        }
    }

    /// Close stdin, kill the process group, reap the child, and return
    /// captured stderr.
    async fn shutdown(&mut self) -> Option<String> {
        drop(self.stdin.take());
        self.group.kill(&self.server);
        match timeout(REAP_TIMEOUT, self.child.kill()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("{}: kill failed: {}", self.server, e),
            Err(_) => tracing::warn!("{}: child not reaped within {:?}", self.server, REAP_TIMEOUT),
        }
        if let Some(mut drain) = self.drain.take()
            && timeout(STDERR_SETTLE, &mut drain).await.is_err()
        {
            drain.abort();
        }
        let captured = std::mem::take(&mut *self.stderr.lock().await);
        (!captured.is_empty()).then_some(captured)
    }
}

impl Drop for StdioSession {
    fn drop(&mut self) {
        self.group.kill(&self.server);
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

/// Process group led by the spawned child; killed at most once.
struct ProcessGroup(Option<i32>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id().and_then(|pid| i32::try_from(pid).ok()))
    }

    #[cfg(unix)]
    fn kill(&mut self, server: &str) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pgid) = self.0.take() else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!("{}: killing process group {} failed: {}", server, pgid, e),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self, _server: &str) {
        self.0 = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    Complete,
    /// The line exceeded the limit; only its first `limit` bytes were kept.
    Oversized,
}

/// Read one `\n`-terminated line of raw bytes into `buf` (without the
/// newline). Returns `None` at end of stream. Memory use is bounded by
/// `limit` no matter how long the line is.
async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<Option<LineRead>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut oversized = false;
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any.then_some(if oversized {
                LineRead::Oversized
            } else {
                LineRead::Complete
            }));
        }
        read_any = true;
        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        let room = limit.saturating_sub(buf.len());
        if chunk.len() > room {
            oversized = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);
        if newline.is_some() {
            return Ok(Some(if oversized {
                LineRead::Oversized
            } else {
                LineRead::Complete
            }));
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, buffer: Arc<Mutex<String>>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    while let Ok(Some(_)) = read_line_capped(&mut reader, &mut line, STDERR_LIMIT).await {
        let text = String::from_utf8_lossy(&line);
        let mut buf = buffer.lock().await;
        push_bounded(&mut buf, text.trim_end_matches('\r'), STDERR_LIMIT);
    }
}

/// Append a line, dropping the oldest content beyond `limit` bytes.
fn push_bounded(buf: &mut String, line: &str, limit: usize) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
    if buf.len() > limit {
        let mut cut = buf.len() - limit;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::FailureKind;

    fn descriptor(command: &str, args: &[&str]) -> ServerDescriptor {
        ServerDescriptor {
            name: "t".into(),
            transport: ServerTransport::Stdio {
                command: command.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: HashMap::new(),
            },
            timeout: None,
            declared_tools: None,
        }
    }

    #[test]
    fn bare_launchers_are_configuration_errors() {
        assert!(check_launcher("npx", &[]).is_err());
        assert!(check_launcher("/usr/local/bin/uvx", &["".into()]).is_err());
        assert!(check_launcher("npx", &["-y".into(), "pkg".into()]).is_ok());
        assert!(check_launcher("node", &[]).is_ok());
    }

    #[test]
    fn stderr_buffer_keeps_the_tail() {
        let mut buf = String::new();
        push_bounded(&mut buf, "first line", 16);
        push_bounded(&mut buf, "second line", 16);
        assert!(buf.len() <= 16);
        assert!(buf.ends_with("second line"));
    }

    #[test]
    fn request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn missing_binary_is_a_connection_failure() {
        let d = descriptor("/definitely/not/a/real/binary", &[]);
        let err = StdioDiscovery::new(1)
            .discover(&d, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConnectionFailure);
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn bare_npx_never_spawns() {
        let err = StdioDiscovery::new(1)
            .discover(&descriptor("npx", &[]), Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_reports_stderr() {
        let d = descriptor("sh", &["-c", "echo kaboom >&2; exit 3"]);
        let err = StdioDiscovery::new(0)
            .discover(&d, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConnectionFailure);
        assert!(err.to_string().contains("kaboom"), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uncorrelated_response_is_protocol_error() {
        let script = r#"read line; echo 'starting up'; echo '{"jsonrpc":"2.0","id":"nope","result":{}}'; sleep 5"#;
        let d = descriptor("sh", &["-c", script]);
        let err = StdioDiscovery::new(0)
            .discover(&d, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol, "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_server_times_out_at_deadline() {
        let d = descriptor("sleep", &["30"]);
        let started = std::time::Instant::now();
        let err = StdioDiscovery::new(0)
            .discover(&d, Instant::now() + Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn capped_reader_splits_bytes_and_bounds_memory() {
        let mut input: &[u8] = b"\xff\xfe banner\n{\"a\":1}\r\n0123456789abcdef\ntail";
        let mut buf = Vec::new();
        let read = read_line_capped(&mut input, &mut buf, 8).await.unwrap();
        assert_eq!(read, Some(LineRead::Oversized));
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[..2], b"\xff\xfe");

        let read = read_line_capped(&mut input, &mut buf, 64).await.unwrap();
        assert_eq!(read, Some(LineRead::Complete));
        assert_eq!(buf.trim_ascii(), b"{\"a\":1}");

        let read = read_line_capped(&mut input, &mut buf, 10).await.unwrap();
        assert_eq!(read, Some(LineRead::Oversized));
        assert_eq!(buf, b"0123456789");

        let read = read_line_capped(&mut input, &mut buf, 64).await.unwrap();
        assert_eq!(read, Some(LineRead::Complete));
        assert_eq!(buf, b"tail");
        assert_eq!(read_line_capped(&mut input, &mut buf, 64).await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn binary_stdout_noise_is_skipped() {
        let script = r##"read init
id=$(printf '%s' "$init" | sed 's/.*"id":\([0-9]*\).*/\1/')
printf '\377\376 banner\n'
printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{}}}\n' "$id"
read note
read list
id=$(printf '%s' "$list" | sed 's/.*"id":\([0-9]*\).*/\1/')
printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"after_noise"}]}}\n' "$id"
sleep 5
"##;
        let d = descriptor("sh", &["-c", script]);
        let listing = StdioDiscovery::new(0)
            .discover(&d, Instant::now() + Duration::from_secs(5))
            .await
            .expect("noise does not fail the server");
        assert_eq!(listing.tools.len(), 1);
        assert_eq!(listing.tools[0].name, "after_noise");
        assert_eq!(
            listing.warnings,
            vec!["Ignored 1 non-JSON stdout line(s)".to_string()]
        );
    }

    /// Alive unless `/proc/<pid>` is gone or the process is a zombie.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn launcher_grandchildren_die_with_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 300 & echo $! > {}; wait", pid_file.display());
        let d = descriptor("sh", &["-c", script.as_str()]);
        let err = StdioDiscovery::new(0)
            .discover(&d, Instant::now() + Duration::from_millis(800))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);

        let pid = std::fs::read_to_string(&pid_file).expect("grandchild pid recorded");
        let pid = pid.trim();
        let until = std::time::Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && std::time::Instant::now() < until {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(pid), "grandchild {pid} outlived the session");
    }
}
