//! In-process MCP server host
//!
//! Each agent imports a set of in-process tool servers. A server declares
//! its name, version and tools, and serves calls with structured
//! arguments, returning content blocks. Tool traffic from the subprocess
//! arrives as `mcp_message` control requests carrying JSON-RPC, which the
//! host routes to the named server.

mod agent;
mod flutter;
mod git;
mod memory;
mod tasks;

pub use agent::AgentServer;
pub use flutter::FlutterRuntimeServer;
pub use git::GitServer;
pub use memory::MemoryServer;
pub use tasks::{TaskEntry, TaskServer, TaskStatus};

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::McpMessageHandler;

/// Errors from tool handlers.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Execution(String),

    #[error("server {0} is not running")]
    NotRunning(String),
}

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        Self::Execution(message)
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        Self::Execution(message.to_string())
    }
}

/// A content block returned from a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Declared metadata for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// The fully qualified tool name the subprocess sees.
pub fn qualified_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{}__{}", server, tool)
}

/// An in-process tool server.
#[async_trait]
pub trait McpServer: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    fn tool_names(&self) -> Vec<String> {
        self.tool_definitions().into_iter().map(|t| t.name).collect()
    }

    async fn start(&self) -> Result<(), ToolError>;

    async fn stop(&self) -> Result<(), ToolError>;

    fn is_running(&self) -> bool;

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Vec<ToolContent>, ToolError>;

    /// Downcast support for typed lookup on a client.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// The per-client registry of servers, addressable by name.
#[derive(Clone, Default)]
pub struct McpHost {
    servers: Vec<Arc<dyn McpServer>>,
}

impl McpHost {
    pub fn new(servers: Vec<Arc<dyn McpServer>>) -> Self {
        Self { servers }
    }

    pub fn server(&self, name: &str) -> Option<Arc<dyn McpServer>> {
        self.servers.iter().find(|s| s.name() == name).cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name().to_string()).collect()
    }

    /// Typed lookup by server name.
    pub fn server_as<T: McpServer + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let server = self.server(name)?;
        server.as_any_arc().downcast::<T>().ok()
    }

    /// Start every registered server, skipping already-running shared ones.
    pub async fn start_all(&self) -> Result<(), ToolError> {
        for server in &self.servers {
            if server.is_running() {
                continue;
            }
            server.start().await?;
        }
        Ok(())
    }

    /// Stop every server not named in `keep_running` (shared servers the
    /// network still holds).
    pub async fn stop_except(&self, keep_running: &[String]) {
        for server in &self.servers {
            if keep_running.iter().any(|name| name == server.name()) {
                continue;
            }
            if let Err(e) = server.stop().await {
                warn!("stopping MCP server {} failed: {}", server.name(), e);
            }
        }
    }
}

#[async_trait]
impl McpMessageHandler for McpHost {
    async fn handle(&self, server_name: &str, message: Value) -> Value {
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");

        // Notifications carry no id and get no reply.
        let Some(id) = id else {
            return Value::Null;
        };

        let Some(server) = self.server(server_name) else {
            return rpc_error(id, -32602, &format!("unknown server: {}", server_name));
        };

        match method {
            "initialize" => rpc_result(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": server.name(), "version": server.version()},
                }),
            ),
            "tools/list" => rpc_result(id, json!({"tools": server.tool_definitions()})),
            "tools/call" => {
                let params = message.get("params").unwrap_or(&Value::Null);
                let tool = params.get("name").and_then(Value::as_str).unwrap_or("");
                let args = params.get("arguments").cloned().unwrap_or(json!({}));
                match server.call_tool(tool, args).await {
                    Ok(content) => rpc_result(
                        id,
                        json!({"content": content, "isError": false}),
                    ),
                    Err(e) => rpc_result(
                        id,
                        json!({
                            "content": [ToolContent::text(e.to_string())],
                            "isError": true,
                        }),
                    ),
                }
            }
            other => rpc_error(id, -32601, &format!("method not found: {}", other)),
        }
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
