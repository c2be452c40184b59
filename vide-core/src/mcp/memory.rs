//! Memory server
//!
//! Long-lived key/value memory per project, shared by every agent in a
//! network and persisted to the project's `memory.json`.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{McpServer, ToolContent, ToolDefinition, ToolError};
use crate::persistence::MemoryStore;

pub struct MemoryServer {
    store: Arc<MemoryStore>,
    running: AtomicBool,
}

impl MemoryServer {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            running: AtomicBool::new(false),
        }
    }

    fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
        args.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidInput(format!("missing required field: {}", key)))
    }
}

#[async_trait]
impl McpServer for MemoryServer {
    fn name(&self) -> &str {
        "memory"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let key_only = json!({
            "type": "object",
            "properties": {"key": {"type": "string"}},
            "required": ["key"]
        });
        vec![
            ToolDefinition::new(
                "store_memory",
                "Store a fact under a key; replaces any existing value for that key.",
                json!({
                    "type": "object",
                    "properties": {
                        "key": {"type": "string"},
                        "value": {"type": "string"}
                    },
                    "required": ["key", "value"]
                }),
            ),
            ToolDefinition::new("retrieve_memory", "Retrieve the value stored under a key.", key_only.clone()),
            ToolDefinition::new(
                "list_memories",
                "List every stored key with its value.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::new("delete_memory", "Delete the entry stored under a key.", key_only),
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
        match tool {
            "store_memory" => {
                let key = Self::required_str(&args, "key")?;
                let value = Self::required_str(&args, "value")?;
                let entry = self
                    .store
                    .upsert(key, value)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(vec![ToolContent::text(format!(
                    "Stored memory under key '{}'.",
                    entry.key
                ))])
            }
            "retrieve_memory" => {
                let key = Self::required_str(&args, "key")?;
                let entry = self
                    .store
                    .get(key)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                match entry {
                    Some(entry) => Ok(vec![ToolContent::text(entry.value)]),
                    None => Ok(vec![ToolContent::text(format!(
                        "No memory stored under key '{}'.",
                        key
                    ))]),
                }
            }
            "list_memories" => {
                let entries = self
                    .store
                    .list()
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                if entries.is_empty() {
                    return Ok(vec![ToolContent::text("No memories stored.")]);
                }
                let listing = entries
                    .iter()
                    .map(|e| format!("{}: {}", e.key, e.value))
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(vec![ToolContent::text(listing)])
            }
            "delete_memory" => {
                let key = Self::required_str(&args, "key")?;
                let removed = self
                    .store
                    .delete(key)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                if removed {
                    Ok(vec![ToolContent::text(format!("Deleted memory '{}'.", key))])
                } else {
                    Ok(vec![ToolContent::text(format!(
                        "No memory stored under key '{}'.",
                        key
                    ))])
                }
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
