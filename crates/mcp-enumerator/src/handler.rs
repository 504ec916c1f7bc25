//! MCP server handler exposing the `enumerate_tools` tool.
//!
//! The tool's arguments are an enumeration request (`mcp_json` or bare
//! `mcpServers`, plus the optional knobs); the result text is the JSON
//! envelope produced from the aggregated report.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    CallToolResult, ClientRequest, ListToolsResult, RpcError, TextContent, Tool, ToolInputSchema,
    schema_utils::{NotificationFromClient, RequestFromClient, ResultFromServer},
};
use rust_mcp_sdk::{
    McpServer,
    mcp_server::{ServerHandlerCore, enforce_compatible_protocol_version},
};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::orchestrator::Orchestrator;
use crate::report::Envelope;
use crate::request::EnumerationRequest;

pub const ENUMERATE_TOOL: &str = "enumerate_tools";

pub struct EnumeratorServerHandler {
    orchestrator: Arc<Orchestrator>,
}

impl EnumeratorServerHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn tool_definitions(&self) -> Vec<Tool> {
        let mut props = HashMap::<String, JsonMap<String, JsonValue>>::new();
        let mut prop = |name: &str, ty: &str, description: &str| {
            let mut schema = JsonMap::new();
            schema.insert("type".to_string(), JsonValue::String(ty.to_string()));
            schema.insert(
                "description".to_string(),
                JsonValue::String(description.to_string()),
            );
            props.insert(name.to_string(), schema);
        };
        prop(
            "mcp_json",
            "object",
            "MCP configuration document: { mcpServers: { <name>: { url | command, ... } } }",
        );
        prop(
            "mcpServers",
            "object",
            "Bare server map, accepted instead of mcp_json",
        );
        prop(
            "timeout_seconds",
            "integer",
            "Overall discovery timeout in seconds (5-300, default 30)",
        );
        prop(
            "include_schemas",
            "boolean",
            "Include tool input schemas (default true)",
        );
        prop(
            "parallel_discovery",
            "boolean",
            "Discover servers concurrently (default true)",
        );

        vec![Tool {
            annotations: None,
            description: Some(
                "List the tools exposed by each configured MCP server (HTTP, stdio or config-only)."
                    .to_string(),
            ),
            input_schema: ToolInputSchema::new(vec![], Some(props)),
            meta: None,
            name: ENUMERATE_TOOL.to_string(),
            output_schema: None,
            title: Some("Enumerate MCP tools".to_string()),
        }]
    }

    /// Parse, validate and run one request; returns the envelope text.
    async fn enumerate(
        &self,
        arguments: Option<JsonMap<String, JsonValue>>,
    ) -> Result<String, RpcError> {
        let args = JsonValue::Object(arguments.unwrap_or_default());
        let request = EnumerationRequest::from_json_value(args).map_err(|e| {
            tracing::warn!("rejecting enumerate_tools call: {}", e);
            RpcError::invalid_params().with_message(e.to_string())
        })?;
        let report = self.orchestrator.enumerate(&request).await.map_err(|e| {
            tracing::warn!("rejecting enumerate_tools call: {}", e);
            RpcError::invalid_params().with_message(e.to_string())
        })?;
        serde_json::to_string(&Envelope::from(report))
            .map_err(|e| RpcError::internal_error().with_message(e.to_string()))
    }
}

#[async_trait]
impl ServerHandlerCore for EnumeratorServerHandler {
    async fn handle_request(
        &self,
        request: RequestFromClient,
        runtime: &dyn McpServer,
    ) -> std::result::Result<ResultFromServer, RpcError> {
        let method_name = request.method().to_owned();
        tracing::debug!("handle_request: method={}", method_name);
        match request {
            RequestFromClient::ClientRequest(client_request) => match client_request {
                ClientRequest::InitializeRequest(initialize_request) => {
                    let mut server_info = runtime.server_info().to_owned();
                    if let Some(updated_protocol_version) = enforce_compatible_protocol_version(
                        &initialize_request.params.protocol_version,
                        &server_info.protocol_version,
                    )
                    .map_err(|err| {
                        tracing::error!(
                            "incompatible protocol version (client={}, server={})",
                            initialize_request.params.protocol_version,
                            server_info.protocol_version
                        );
                        RpcError::internal_error().with_message(err.to_string())
                    })? {
                        server_info.protocol_version = updated_protocol_version;
                    }
                    tracing::info!("initialized (protocol={})", server_info.protocol_version);
                    Ok(server_info.into())
                }

                ClientRequest::ListToolsRequest(_) => Ok(ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: self.tool_definitions(),
                }
                .into()),

                ClientRequest::CallToolRequest(request) => {
                    let tool = request.tool_name().to_string();
                    if tool != ENUMERATE_TOOL {
                        tracing::warn!("unknown tool: {}", tool);
                        return Err(RpcError::method_not_found()
                            .with_message(format!("Unknown tool '{tool}'")));
                    }
                    let text = self.enumerate(request.params.arguments.clone()).await?;
                    Ok(CallToolResult::text_content(vec![TextContent::from(text)]).into())
                }

                _ => {
                    tracing::warn!("method not implemented: {}", method_name);
                    Err(RpcError::method_not_found()
                        .with_message(format!("No handler is implemented for '{method_name}'.")))
                }
            },
            RequestFromClient::CustomRequest(_) => Err(RpcError::method_not_found()
                .with_message("No handler is implemented for custom requests.".to_string())),
        }
    }

    async fn handle_notification(
        &self,
        notification: NotificationFromClient,
        _: &dyn McpServer,
    ) -> std::result::Result<(), RpcError> {
        if let NotificationFromClient::CustomNotification(_) = notification {
            tracing::debug!("ignoring custom notification");
        }
        Ok(())
    }

    async fn handle_error(
        &self,
        error: &RpcError,
        _: &dyn McpServer,
    ) -> std::result::Result<(), RpcError> {
        tracing::error!(
            "handle_error from client (code={:?}, message={:?})",
            error.code,
            error.message
        );
        Ok(())
    }
}
