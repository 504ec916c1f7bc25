pub mod config;
pub mod handler;
pub mod mcp;
pub mod orchestrator;
pub mod report;
pub mod request;
