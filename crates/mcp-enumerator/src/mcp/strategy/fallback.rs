//! No-I/O strategy for servers without a live introspection channel.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use super::ToolDiscovery;
use crate::mcp::error::DiscoveryError;
use crate::mcp::tools::{DiscoveredTool, ToolListing, decode_declared};
use crate::mcp::types::ServerDescriptor;

/// Reads declared `tools` metadata, or produces a `<server>_config` placeholder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataDiscovery;

impl MetadataDiscovery {
    pub fn listing_for(server: &ServerDescriptor) -> ToolListing {
        if let Some(declared) = server.declared_tools.as_ref() {
            let mut listing = ToolListing::new(decode_declared(&server.name, declared));
            let entries = match declared {
                JsonValue::Array(a) => a.len(),
                JsonValue::Object(m) => m.len(),
                _ => 1,
            };
            tracing::debug!(
                "declared metadata for {}: {} usable tool(s) of {}",
                server.name,
                listing.tools.len(),
                entries
            );
            let skipped = entries.saturating_sub(listing.tools.len());
            if skipped > 0 {
                listing.warn(format!("Skipped {skipped} unreadable declared tool entries"));
            }
            return listing;
        }
        let mut listing = ToolListing::new(vec![DiscoveredTool {
            server: server.name.clone(),
            name: format!("{}_config", server.name),
            description: format!("Configuration-based tool for {}", server.name),
            input_schema: JsonValue::Null,
        }]);
        listing.warn("Created fallback tool from MCP JSON config");
        listing
    }
}

#[async_trait]
impl ToolDiscovery for MetadataDiscovery {
    async fn discover(
        &self,
        server: &ServerDescriptor,
        _deadline: Instant,
    ) -> Result<ToolListing, DiscoveryError> {
        Ok(Self::listing_for(server))
    }
}
