//! Per-server discovery failures.

use serde::Serialize;
use thiserror::Error;

/// Coarse failure class reported alongside the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Timeout,
    ConnectionFailure,
    Protocol,
    Upstream,
    Internal,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid server configuration: {0}")]
    Configuration(String),

    #[error("timed out during {phase}{}", stderr_suffix(.stderr))]
    Timeout {
        phase: &'static str,
        stderr: Option<String>,
    },

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("process failed: {message}{}", stderr_suffix(.stderr))]
    ProcessFailure {
        message: String,
        stderr: Option<String>,
    },

    #[error("protocol error: {message}{}", stderr_suffix(.stderr))]
    Protocol {
        message: String,
        stderr: Option<String>,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("upstream error{}: {message}{}", code_suffix(.code), stderr_suffix(.stderr))]
    Upstream {
        code: Option<i64>,
        message: String,
        stderr: Option<String>,
    },

    #[error("strategy panicked: {0}")]
    Internal(String),
}

impl DiscoveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DiscoveryError::Configuration(_) => FailureKind::Configuration,
            DiscoveryError::Timeout { .. } => FailureKind::Timeout,
            DiscoveryError::ConnectionFailure(_) | DiscoveryError::ProcessFailure { .. } => {
                FailureKind::ConnectionFailure
            }
            DiscoveryError::Protocol { .. } | DiscoveryError::MalformedResponse(_) => {
                FailureKind::Protocol
            }
            DiscoveryError::Upstream { .. } => FailureKind::Upstream,
            DiscoveryError::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn timeout(phase: &'static str) -> Self {
        DiscoveryError::Timeout {
            phase,
            stderr: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        DiscoveryError::Protocol {
            message: message.into(),
            stderr: None,
        }
    }

    pub fn upstream(code: Option<i64>, message: impl Into<String>) -> Self {
        DiscoveryError::Upstream {
            code,
            message: message.into(),
            stderr: None,
        }
    }

    /// Attach captured child stderr where the variant carries it.
    pub fn with_stderr(mut self, captured: Option<String>) -> Self {
        let captured = captured.filter(|s| !s.trim().is_empty());
        if captured.is_none() {
            return self;
        }
        match &mut self {
            DiscoveryError::Timeout { stderr, .. }
            | DiscoveryError::ProcessFailure { stderr, .. }
            | DiscoveryError::Protocol { stderr, .. }
            | DiscoveryError::Upstream { stderr, .. } => *stderr = captured,
            DiscoveryError::MalformedResponse(message) => {
                let suffix = stderr_suffix(&captured);
                message.push_str(&suffix);
            }
            _ => {}
        }
        self
    }
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => format!(" (stderr: {})", s.trim()),
        _ => String::new(),
    }
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" {c}")).unwrap_or_default()
}
