//! Task-management server
//!
//! A shared in-memory task board for one network. Agents create tasks,
//! claim them, and mark progress; the board is the coordination surface
//! between the orchestrator and its workers.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{McpServer, ToolContent, ToolDefinition, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "inProgress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct TaskServer {
    tasks: parking_lot::Mutex<Vec<TaskEntry>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Default for TaskServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskServer {
    pub fn new() -> Self {
        Self {
            tasks: parking_lot::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    /// Snapshot of the board, in creation order.
    pub fn tasks(&self) -> Vec<TaskEntry> {
        self.tasks.lock().clone()
    }

    fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
        args.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidInput(format!("missing required field: {}", key)))
    }

    fn render(tasks: &[TaskEntry]) -> String {
        if tasks.is_empty() {
            return "No tasks.".to_string();
        }
        tasks
            .iter()
            .map(|t| {
                let status = match t.status {
                    TaskStatus::Pending => "pending",
                    TaskStatus::InProgress => "in progress",
                    TaskStatus::Completed => "completed",
                };
                let owner = t
                    .owner
                    .as_deref()
                    .map(|o| format!(" (owner: {})", o))
                    .unwrap_or_default();
                format!("[{}] {} - {}{}", t.id, t.title, status, owner)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl McpServer for TaskServer {
    fn name(&self) -> &str {
        "task-management"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "create_task",
                "Add a task to the shared board.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "description": {"type": "string"}
                    },
                    "required": ["title"]
                }),
            ),
            ToolDefinition::new(
                "update_task",
                "Update a task's status or owner.",
                json!({
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "status": {"type": "string", "enum": ["pending", "inProgress", "completed"]},
                        "owner": {"type": "string"}
                    },
                    "required": ["id"]
                }),
            ),
            ToolDefinition::new(
                "list_tasks",
                "List every task on the board.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::new(
                "complete_task",
                "Mark a task completed.",
                json!({
                    "type": "object",
                    "properties": {"id": {"type": "string"}},
                    "required": ["id"]
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
        match tool {
            "create_task" => {
                let title = Self::required_str(&args, "title")?;
                let description = args
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
                let entry = TaskEntry {
                    id: id.clone(),
                    title: title.to_string(),
                    description,
                    status: TaskStatus::Pending,
                    owner: None,
                    created_at: Utc::now(),
                };
                self.tasks.lock().push(entry);
                Ok(vec![ToolContent::text(format!("Created task {}.", id))])
            }
            "update_task" => {
                let id = Self::required_str(&args, "id")?;
                let status = match args.get("status").and_then(Value::as_str) {
                    Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
                        ToolError::InvalidInput(format!("unknown status: {}", raw))
                    })?),
                    None => None,
                };
                let owner = args
                    .get("owner")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let mut tasks = self.tasks.lock();
                let task = tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| ToolError::InvalidInput(format!("no task with id {}", id)))?;
                if let Some(status) = status {
                    task.status = status;
                }
                if let Some(owner) = owner {
                    task.owner = Some(owner);
                }
                Ok(vec![ToolContent::text(format!("Updated task {}.", id))])
            }
            "list_tasks" => {
                let tasks = self.tasks.lock();
                Ok(vec![ToolContent::text(Self::render(&tasks))])
            }
            "complete_task" => {
                let id = Self::required_str(&args, "id")?;
                let mut tasks = self.tasks.lock();
                let task = tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| ToolError::InvalidInput(format!("no task with id {}", id)))?;
                task.status = TaskStatus::Completed;
                Ok(vec![ToolContent::text(format!("Completed task {}.", id))])
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
