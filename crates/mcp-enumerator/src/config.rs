use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::report::StatusPolicy;

#[derive(Debug, Default, Deserialize)]
pub struct UserConfig {
    pub logging: Option<LoggingCfg>,
    pub enumerator: Option<EnumeratorCfg>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingCfg {
    pub to_file: Option<bool>,
    pub dir: Option<String>,
    pub json: Option<bool>,
    pub compact: Option<bool>,
    pub pretty: Option<bool>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnumeratorCfg {
    pub server_timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_servers: Option<usize>,
    pub http_max_retries: Option<u32>,
    pub http_backoff_ms: Option<u64>,
    pub spawn_retries: Option<u32>,
    pub status_policy: Option<StatusPolicy>,
    pub shutdown_grace_ms: Option<u64>,

    pub transport: Option<String>, // "stdio" | "http"
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub fn from_toml_str(s: &str) -> anyhow::Result<UserConfig> {
    let cfg: UserConfig = toml::from_str(s).context("parse config.toml")?;
    Ok(cfg)
}

pub fn load_user_config(home: &Path) -> anyhow::Result<Option<UserConfig>> {
    let path = home.join("config.toml");
    if !path.exists() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    from_toml_str(&s).map(Some)
}

/// Enumerator home: explicit value, else `$HOME/.mcp-enumerator`, else `./.mcp-enumerator`.
pub fn resolve_home(explicit: &str) -> PathBuf {
    if !explicit.is_empty() {
        return expand_home(explicit);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".mcp-enumerator");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".mcp-enumerator")
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_tables() {
        let cfg = from_toml_str(
            r#"
[logging]
level = "debug"
json = true

[enumerator]
max_concurrency = 4
status_policy = "any"
http_backoff_ms = 50
"#,
        )
        .expect("parse ok");
        let logging = cfg.logging.expect("logging table");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.json, Some(true));
        let e = cfg.enumerator.expect("enumerator table");
        assert_eq!(e.max_concurrency, Some(4));
        assert_eq!(e.status_policy, Some(StatusPolicy::AnyConnected));
        assert_eq!(e.http_backoff_ms, Some(50));
        assert!(e.port.is_none());
    }

    #[test]
    fn missing_file_is_none_and_bad_file_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_user_config(dir.path()).expect("no error").is_none());

        std::fs::write(dir.path().join("config.toml"), "[enumerator]\nmax_servers = \"many\"\n")
            .expect("write");
        assert!(load_user_config(dir.path()).is_err());

        std::fs::write(dir.path().join("config.toml"), "[enumerator]\nmax_servers = 8\n")
            .expect("write");
        let cfg = load_user_config(dir.path()).expect("ok").expect("some");
        assert_eq!(cfg.enumerator.and_then(|e| e.max_servers), Some(8));
    }

    #[test]
    fn explicit_home_wins() {
        assert_eq!(resolve_home("/srv/enum"), PathBuf::from("/srv/enum"));
    }
}
