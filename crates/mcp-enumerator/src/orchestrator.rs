//! Discovery fan-out: one task per server behind an admission gate, bounded
//! by per-server and overall deadlines, collected back in declaration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::Instrument;
use uuid::Uuid;

use crate::mcp::error::DiscoveryError;
use crate::mcp::strategy::{RetryPolicy, Strategies, ToolDiscovery};
use crate::mcp::tools::ToolListing;
use crate::mcp::types::ServerDescriptor;
use crate::report::{EnumerationReport, ServerRun, StatusPolicy, aggregate};
use crate::request::{EnumerationRequest, RequestError};

/// Stand-in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `from + budget`, saturating at a far-future instant instead of overflowing.
fn deadline_after(from: Instant, budget: Duration) -> Instant {
    from.checked_add(budget)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct EnumeratorSettings {
    /// Used when a server entry declares no `timeout` of its own.
    pub server_timeout: Duration,
    pub max_concurrency: usize,
    pub max_servers: usize,
    pub retry: RetryPolicy,
    pub status_policy: StatusPolicy,
    /// Time strategies get past a deadline to clean up before being aborted.
    pub shutdown_grace: Duration,
}

impl Default for EnumeratorSettings {
    fn default() -> Self {
        Self {
            server_timeout: Duration::from_secs(30),
            max_concurrency: 16,
            max_servers: 64,
            retry: RetryPolicy::default(),
            status_policy: StatusPolicy::AllConnected,
            shutdown_grace: Duration::from_millis(1500),
        }
    }
}

pub struct Orchestrator {
    settings: EnumeratorSettings,
    strategies: Strategies,
}

impl Orchestrator {
    pub fn new(settings: EnumeratorSettings) -> Self {
        let strategies = Strategies::live(&settings.retry);
        Self::with_strategies(settings, strategies)
    }

    pub fn with_strategies(settings: EnumeratorSettings, strategies: Strategies) -> Self {
        Self {
            settings,
            strategies,
        }
    }

    /// Validate the request, then run it.
    pub async fn enumerate(
        &self,
        request: &EnumerationRequest,
    ) -> Result<EnumerationReport, RequestError> {
        request.validate(self.settings.max_servers)?;
        Ok(self.run(request).await)
    }

    /// Run discovery for every server in the request. Never fails: each
    /// server's problem is confined to its own outcome.
    pub async fn run(&self, request: &EnumerationRequest) -> EnumerationReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("enumeration", %run_id);
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &EnumerationRequest) -> EnumerationReport {
        let started = Instant::now();
        let overall = deadline_after(started, request.timeout());
        let descriptors: Vec<ServerDescriptor> = request
            .servers
            .iter()
            .map(|(name, spec)| ServerDescriptor::from_spec(name.as_str(), spec))
            .collect();
        tracing::info!(
            "enumerating MCP servers: count={}, parallel={}, timeout_secs={}",
            descriptors.len(),
            request.parallel_discovery,
            request.timeout_seconds
        );

        let labels: Vec<RunLabel> = descriptors.iter().map(RunLabel::of).collect();
        let slots = if request.parallel_discovery {
            self.run_parallel(descriptors, overall).await
        } else {
            self.run_sequential(descriptors, overall).await
        };

        let runs: Vec<ServerRun> = slots
            .into_iter()
            .zip(labels)
            .map(|(slot, label)| {
                let mut run = slot.unwrap_or_else(|| {
                    label.into_run(
                        started.elapsed(),
                        Err(DiscoveryError::timeout("overall deadline")),
                    )
                });
                if !request.include_schemas
                    && let Ok(listing) = run.result.as_mut()
                {
                    for tool in listing.tools.iter_mut() {
                        tool.input_schema = JsonValue::Null;
                    }
                }
                log_run(&run);
                run
            })
            .collect();

        let report = aggregate(runs, self.settings.status_policy, Utc::now());
        tracing::info!(
            "enumeration finished: status={:?}, connected={}/{}, tools={}, elapsed_ms={}",
            report.status,
            report.connected_servers,
            report.total_servers,
            report.tools.len(),
            started.elapsed().as_millis()
        );
        report
    }

    async fn run_parallel(
        &self,
        descriptors: Vec<ServerDescriptor>,
        overall: Instant,
    ) -> Vec<Option<ServerRun>> {
        let mut slots: Vec<Option<ServerRun>> = (0..descriptors.len()).map(|_| None).collect();
        let gate = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut positions = HashMap::with_capacity(descriptors.len());
        let mut labels = Vec::with_capacity(descriptors.len());

        for (idx, server) in descriptors.into_iter().enumerate() {
            labels.push(RunLabel::of(&server));
            let strategy = self.strategies.for_method(server.method());
            let per_server = server.timeout.unwrap_or(self.settings.server_timeout);
            let grace = self.settings.shutdown_grace;
            let gate = Arc::clone(&gate);
            let task = async move {
                // The gate is never closed; a failed acquire just skips the limit.
                let _permit = gate.acquire_owned().await.ok();
                discover_one(strategy, server, per_server, overall, grace).await
            };
            let handle = set.spawn(task.in_current_span());
            positions.insert(handle.id(), idx);
        }

        let hard_stop = deadline_after(overall, self.settings.shutdown_grace);
        loop {
            match timeout_at(hard_stop, set.join_next_with_id()).await {
                Ok(None) => break,
                Ok(Some(Ok((id, run)))) => {
                    if let Some(&idx) = positions.get(&id) {
                        slots[idx] = Some(run);
                    }
                }
                Ok(Some(Err(err))) => {
                    if let Some(&idx) = positions.get(&err.id()) {
                        slots[idx] = Some(failed_task(labels[idx].clone(), err));
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        "overall deadline reached with {} server(s) still running; aborting",
                        set.len()
                    );
                    set.abort_all();
                    // Keep anything that finished in the meantime; aborted tasks
                    // drop their strategies (and child processes) here.
                    while let Some(joined) = set.join_next_with_id().await {
                        if let Ok((id, run)) = joined
                            && let Some(&idx) = positions.get(&id)
                        {
                            slots[idx] = Some(run);
                        }
                    }
                    break;
                }
            }
        }
        slots
    }

    async fn run_sequential(
        &self,
        descriptors: Vec<ServerDescriptor>,
        overall: Instant,
    ) -> Vec<Option<ServerRun>> {
        let mut slots = Vec::with_capacity(descriptors.len());
        let hard_stop = deadline_after(overall, self.settings.shutdown_grace);
        for server in descriptors {
            if Instant::now() >= overall {
                slots.push(None);
                continue;
            }
            let label = RunLabel::of(&server);
            let strategy = self.strategies.for_method(server.method());
            let per_server = server.timeout.unwrap_or(self.settings.server_timeout);
            let grace = self.settings.shutdown_grace;
            let mut handle = tokio::spawn(
                discover_one(strategy, server, per_server, overall, grace).in_current_span(),
            );
            let slot = match timeout_at(hard_stop, &mut handle).await {
                Ok(Ok(run)) => Some(run),
                Ok(Err(err)) => Some(failed_task(label, err)),
                Err(_) => {
                    handle.abort();
                    // Wait for the abort so the child process is gone before moving on.
                    let _ = handle.await;
                    None
                }
            };
            slots.push(slot);
        }
        slots
    }
}

/// Run one strategy under its effective deadline, fixed at admission.
async fn discover_one(
    strategy: Arc<dyn ToolDiscovery>,
    server: ServerDescriptor,
    per_server: Duration,
    overall: Instant,
    grace: Duration,
) -> ServerRun {
    let admitted = Instant::now();
    let deadline = deadline_after(admitted, per_server).min(overall);
    tracing::debug!(
        "discovering {} via {} (budget_ms={})",
        server.name,
        server.method().as_str(),
        deadline.saturating_duration_since(admitted).as_millis()
    );
    // Strategies watch the deadline themselves; the guard only catches ones that don't.
    let guard = deadline_after(deadline, grace);
    let result = match timeout_at(guard, strategy.discover(&server, deadline)).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::timeout("discovery")),
    };
    RunLabel::of(&server).into_run(admitted.elapsed(), result)
}

/// Identity of a server's run, kept aside for slots whose task never reports.
#[derive(Debug, Clone)]
struct RunLabel {
    name: String,
    transport: &'static str,
    server_url: Option<String>,
}

impl RunLabel {
    fn of(server: &ServerDescriptor) -> Self {
        Self {
            name: server.name.clone(),
            transport: server.transport.label(),
            server_url: server.server_url().map(str::to_string),
        }
    }

    fn into_run(self, duration: Duration, result: Result<ToolListing, DiscoveryError>) -> ServerRun {
        ServerRun {
            name: self.name,
            transport: self.transport,
            server_url: self.server_url,
            duration,
            result,
        }
    }
}

fn failed_task(label: RunLabel, err: JoinError) -> ServerRun {
    let result = if err.is_cancelled() {
        Err(DiscoveryError::timeout("overall deadline"))
    } else {
        Err(DiscoveryError::Internal(panic_message(err)))
    };
    label.into_run(Duration::ZERO, result)
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}

fn log_run(run: &ServerRun) {
    match &run.result {
        Ok(listing) => tracing::info!(
            "server {} connected via {} ({} tool(s), {} warning(s), {} ms)",
            run.name,
            run.transport,
            listing.tools.len(),
            listing.warnings.len(),
            run.duration.as_millis()
        ),
        Err(e) => tracing::warn!(
            "server {} failed via {} ({:?}, {} ms): {}",
            run.name,
            run.transport,
            e.kind(),
            run.duration.as_millis(),
            e
        ),
    }
}
