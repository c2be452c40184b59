//! Agent server
//!
//! Exposes network operations to the agents themselves: spawning workers,
//! messaging peers, reporting status, and terminating finished agents.
//! Each client gets its own instance bound to its agent id, holding the
//! network manager only through a weak handle.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{McpServer, ToolContent, ToolDefinition, ToolError};
use crate::agent_config::AgentType;
use crate::network::{AgentStatus, NetworkOps};

pub struct AgentServer {
    agent_id: String,
    ops: parking_lot::RwLock<Option<Weak<dyn NetworkOps>>>,
    running: AtomicBool,
}

impl AgentServer {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ops: parking_lot::RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Bind the network manager. Weak: the manager owns the clients that
    /// own this server, never the other way around.
    pub fn bind(&self, ops: Weak<dyn NetworkOps>) {
        *self.ops.write() = Some(ops);
    }

    fn network(&self) -> Result<Arc<dyn NetworkOps>, ToolError> {
        self.ops
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ToolError::Execution("network manager is gone".to_string()))
    }

    fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
        args.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidInput(format!("missing required field: {}", key)))
    }
}

#[async_trait]
impl McpServer for AgentServer {
    fn name(&self) -> &str {
        "agent"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "spawn_agent",
                "Spawn a new agent in this network and send it an initial prompt.",
                json!({
                    "type": "object",
                    "properties": {
                        "agent_type": {
                            "type": "string",
                            "description": "main, implementation, planning, contextCollection, \
                                            flutterTester, or userDefined:<name>"
                        },
                        "name": {"type": "string"},
                        "prompt": {"type": "string"}
                    },
                    "required": ["agent_type", "name", "prompt"]
                }),
            ),
            ToolDefinition::new(
                "send_message_to_agent",
                "Deliver a message to another agent in this network.",
                json!({
                    "type": "object",
                    "properties": {
                        "target_agent_id": {"type": "string"},
                        "message": {"type": "string"}
                    },
                    "required": ["target_agent_id", "message"]
                }),
            ),
            ToolDefinition::new(
                "set_agent_status",
                "Report your own status.",
                json!({
                    "type": "object",
                    "properties": {
                        "status": {
                            "type": "string",
                            "enum": ["idle", "working", "waitingForAgent", "waitingForUser"]
                        }
                    },
                    "required": ["status"]
                }),
            ),
            ToolDefinition::new(
                "terminate_agent",
                "Terminate a finished agent. The main agent cannot be terminated.",
                json!({
                    "type": "object",
                    "properties": {
                        "target_agent_id": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["target_agent_id"]
                }),
            ),
        ]
    }

    async fn start(&self) -> Result<(), ToolError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ToolError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Vec<ToolContent>, ToolError> {
        let network = self.network()?;
        match tool {
            "spawn_agent" => {
                let agent_type = AgentType::parse(Self::required_str(&args, "agent_type")?);
                let name = Self::required_str(&args, "name")?;
                let prompt = Self::required_str(&args, "prompt")?;
                let agent_id = network
                    .spawn_agent(&self.agent_id, agent_type, name, prompt)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(vec![ToolContent::text(format!(
                    "Spawned agent {} ({}).",
                    name, agent_id
                ))])
            }
            "send_message_to_agent" => {
                let target = Self::required_str(&args, "target_agent_id")?;
                let message = Self::required_str(&args, "message")?;
                network
                    .route_message(&self.agent_id, target, message)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(vec![ToolContent::text(format!("Delivered to {}.", target))])
            }
            "set_agent_status" => {
                let raw = Self::required_str(&args, "status")?;
                let status = AgentStatus::parse(raw)
                    .ok_or_else(|| ToolError::InvalidInput(format!("unknown status: {}", raw)))?;
                network
                    .set_agent_status(&self.agent_id, status)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(vec![ToolContent::text("Status updated.")])
            }
            "terminate_agent" => {
                let target = Self::required_str(&args, "target_agent_id")?;
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("finished");
                network
                    .terminate_agent(target, reason)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(vec![ToolContent::text(format!("Terminated {}.", target))])
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
