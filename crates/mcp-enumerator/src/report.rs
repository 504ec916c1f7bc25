//! Per-server outcomes and the aggregated enumeration report.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mcp::error::{DiscoveryError, FailureKind};
use crate::mcp::tools::{DiscoveredTool, ToolListing};

/// Raw result of one strategy execution, before aggregation.
#[derive(Debug)]
pub struct ServerRun {
    pub name: String,
    pub transport: &'static str,
    pub server_url: Option<String>,
    pub duration: Duration,
    pub result: Result<ToolListing, DiscoveryError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerOutcome {
    pub name: String,
    pub status: ServerStatus,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub transport: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Partial,
    Failed,
}

/// How per-server results map onto the overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// `success` only when every server connected, `partial` when some did.
    #[default]
    #[serde(alias = "all")]
    AllConnected,
    /// `success` as soon as one server connected.
    #[serde(alias = "any")]
    AnyConnected,
}

impl StatusPolicy {
    pub fn status(&self, connected: usize, total: usize) -> ReportStatus {
        if connected == 0 {
            return ReportStatus::Failed;
        }
        match self {
            StatusPolicy::AllConnected if connected < total => ReportStatus::Partial,
            _ => ReportStatus::Success,
        }
    }
}

impl FromStr for StatusPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "all_connected" => Ok(StatusPolicy::AllConnected),
            "any" | "any_connected" => Ok(StatusPolicy::AnyConnected),
            other => Err(format!("unknown status policy `{other}` (expected `all` or `any`)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnumerationReport {
    pub status: ReportStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub servers: Vec<ServerOutcome>,
    pub tools: Vec<DiscoveredTool>,
    pub total_servers: usize,
    pub connected_servers: usize,
    pub failed_servers: usize,
}

/// Response wrapper: `success` mirrors `status == success`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    pub data: EnumerationReport,
}

impl From<EnumerationReport> for Envelope {
    fn from(report: EnumerationReport) -> Self {
        Self {
            success: report.status == ReportStatus::Success,
            message: report.message.clone(),
            data: report,
        }
    }
}

/// Fold runs (in declaration order) into a report.
pub fn aggregate(
    runs: Vec<ServerRun>,
    policy: StatusPolicy,
    timestamp: DateTime<Utc>,
) -> EnumerationReport {
    let total = runs.len();
    let mut servers = Vec::with_capacity(total);
    let mut tools = Vec::new();

    for run in runs {
        let duration_ms = u64::try_from(run.duration.as_millis()).unwrap_or(u64::MAX);
        match run.result {
            Ok(ToolListing {
                tools: found,
                mut warnings,
            }) => {
                if found.is_empty() {
                    warnings.push("No tools discovered".to_string());
                }
                servers.push(ServerOutcome {
                    name: run.name,
                    status: ServerStatus::Connected,
                    tool_count: found.len(),
                    error: None,
                    error_kind: None,
                    transport: run.transport,
                    server_url: run.server_url,
                    warnings,
                    duration_ms,
                });
                tools.extend(found);
            }
            Err(e) => servers.push(ServerOutcome {
                name: run.name,
                status: ServerStatus::Failed,
                tool_count: 0,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
                transport: run.transport,
                server_url: run.server_url,
                warnings: Vec::new(),
                duration_ms,
            }),
        }
    }

    let connected = servers
        .iter()
        .filter(|s| s.status == ServerStatus::Connected)
        .count();
    let message = if connected == total {
        format!("Successfully connected to all {total} servers")
    } else {
        format!("Connected to {connected} of {total} servers")
    };

    EnumerationReport {
        status: policy.status(connected, total),
        message,
        timestamp,
        servers,
        tools,
        total_servers: total,
        connected_servers: connected,
        failed_servers: total - connected,
    }
}
