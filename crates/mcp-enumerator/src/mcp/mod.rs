//! MCP client side: server descriptors, JSON-RPC framing, tool decoding and
//! the discovery strategies (HTTP, stdio, config metadata).

pub mod error;
pub mod jsonrpc;
pub mod strategy;
pub mod tools;
pub mod types;

pub use error::{DiscoveryError, FailureKind};
pub use tools::DiscoveredTool;
pub use types::{DiscoveryMethod, ServerDescriptor, ServerSpec, select};
