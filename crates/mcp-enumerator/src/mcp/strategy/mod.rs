//! Discovery strategies and the set that dispatches between them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::error::DiscoveryError;
use super::tools::ToolListing;
use super::types::{DiscoveryMethod, ServerDescriptor};

pub mod fallback;
pub mod http;
pub mod stdio;

pub use fallback::MetadataDiscovery;
pub use http::HttpDiscovery;
pub use stdio::StdioDiscovery;

/// Finds the tools one server exposes, finishing before `deadline`.
#[async_trait]
pub trait ToolDiscovery: Send + Sync {
    async fn discover(
        &self,
        server: &ServerDescriptor,
        deadline: Instant,
    ) -> Result<ToolListing, DiscoveryError>;
}

/// Retry knobs shared by the live strategies.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub http_max_retries: u32,
    pub http_backoff: Duration,
    pub spawn_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            http_max_retries: 2,
            http_backoff: Duration::from_millis(250),
            spawn_retries: 1,
        }
    }
}

/// One implementation per [`DiscoveryMethod`].
#[derive(Clone)]
pub struct Strategies {
    pub http: Arc<dyn ToolDiscovery>,
    pub stdio: Arc<dyn ToolDiscovery>,
    pub metadata: Arc<dyn ToolDiscovery>,
}

impl Strategies {
    pub fn live(retry: &RetryPolicy) -> Self {
        Self {
            http: Arc::new(HttpDiscovery::new(retry.http_max_retries, retry.http_backoff)),
            stdio: Arc::new(StdioDiscovery::new(retry.spawn_retries)),
            metadata: Arc::new(MetadataDiscovery),
        }
    }

    pub fn for_method(&self, method: DiscoveryMethod) -> Arc<dyn ToolDiscovery> {
        match method {
            DiscoveryMethod::HttpDiscovery => Arc::clone(&self.http),
            DiscoveryMethod::StdioIntrospection => Arc::clone(&self.stdio),
            DiscoveryMethod::McpJsonParsing => Arc::clone(&self.metadata),
        }
    }
}

/// Exponential backoff step `base * 2^attempt`, capped so it never reaches `deadline`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32, deadline: Instant) -> Option<Duration> {
    let delay = base.saturating_mul(2u32.saturating_pow(attempt));
    let remaining = deadline.saturating_duration_since(Instant::now());
    (delay < remaining).then_some(delay)
}
