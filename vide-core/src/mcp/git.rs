//! Git server
//!
//! Read and write access to the repository at the agent's effective
//! working directory, shelling out to the `git` binary.

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{McpServer, ToolContent, ToolDefinition, ToolError};

pub struct GitServer {
    working_dir: PathBuf,
    running: AtomicBool,
}

impl GitServer {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            running: AtomicBool::new(false),
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, ToolError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|e| ToolError::Execution(format!("failed to run git: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ToolError::Execution(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )))
        }
    }

    fn text_or(text: String, fallback: &str) -> Vec<ToolContent> {
        if text.trim().is_empty() {
            vec![ToolContent::text(fallback)]
        } else {
            vec![ToolContent::text(text)]
        }
    }
}

#[async_trait]
impl McpServer for GitServer {
    fn name(&self) -> &str {
        "git"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let empty = json!({"type": "object", "properties": {}});
        vec![
            ToolDefinition::new("git_status", "Show the working tree status.", empty.clone()),
            ToolDefinition::new(
                "git_diff",
                "Show unstaged changes, optionally limited to one path.",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}}
                }),
            ),
            ToolDefinition::new(
                "git_log",
                "Show recent commits.",
                json!({
                    "type": "object",
                    "properties": {"limit": {"type": "integer", "minimum": 1}}
                }),
            ),
            ToolDefinition::new(
                "git_add",
                "Stage the given paths.",
                json!({
                    "type": "object",
                    "properties": {
                        "paths": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["paths"]
                }),
            ),
            ToolDefinition::new(
                "git_commit",
                "Commit staged changes with a message.",
                json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            ),
            ToolDefinition::new("git_branch", "List branches; the current one is starred.", empty),
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
            "git_status" => {
                let out = self.run_git(&["status", "--porcelain=v1", "--branch"]).await?;
                Ok(Self::text_or(out, "Working tree clean."))
            }
            "git_diff" => {
                let mut cmd = vec!["diff"];
                let path = args.get("path").and_then(Value::as_str);
                if let Some(path) = path {
                    cmd.push("--");
                    cmd.push(path);
                }
                let out = self.run_git(&cmd).await?;
                Ok(Self::text_or(out, "No unstaged changes."))
            }
            "git_log" => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(10)
                    .clamp(1, 100);
                let count = format!("-{}", limit);
                let out = self
                    .run_git(&["log", "--oneline", "--decorate", &count])
                    .await?;
                Ok(Self::text_or(out, "No commits yet."))
            }
            "git_add" => {
                let paths: Vec<String> = args
                    .get("paths")
                    .and_then(Value::as_array)
                    .map(|paths| {
                        paths
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if paths.is_empty() {
                    return Err(ToolError::InvalidInput("paths must not be empty".into()));
                }
                let mut cmd = vec!["add".to_string(), "--".to_string()];
                cmd.extend(paths);
                let cmd_refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
                self.run_git(&cmd_refs).await?;
                Ok(vec![ToolContent::text("Staged.")])
            }
            "git_commit" => {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .filter(|m| !m.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidInput("message must not be empty".into()))?;
                let out = self.run_git(&["commit", "-m", message]).await?;
                Ok(Self::text_or(out, "Committed."))
            }
            "git_branch" => {
                let out = self.run_git(&["branch", "--list"]).await?;
                Ok(Self::text_or(out, "No branches."))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo() -> (tempfile::TempDir, GitServer) {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let path = dir.path().to_path_buf();
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            async move {
                let status = Command::new("git")
                    .args(&args)
                    .current_dir(&path)
                    .output()
                    .await
                    .unwrap();
                assert!(status.status.success(), "git {:?} failed", args);
            }
        };
        run(&["init", "-q"]).await;
        run(&["config", "user.email", "dev@example.com"]).await;
        run(&["config", "user.name", "Dev"]).await;
        let server = GitServer::new(dir.path().to_path_buf());
        (dir, server)
    }

    #[tokio::test]
    async fn test_status_clean_repo() {
        let (_dir, server) = init_repo().await;
        let content = server.call_tool("git_status", json!({})).await.unwrap();
        match &content[0] {
            ToolContent::Text { text } => assert!(text.contains("##")),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_commit_log_round_trip() {
        let (dir, server) = init_repo().await;
        tokio::fs::write(dir.path().join("a.txt"), "hello")
            .await
            .unwrap();

        server
            .call_tool("git_add", json!({"paths": ["a.txt"]}))
            .await
            .unwrap();
        server
            .call_tool("git_commit", json!({"message": "add a.txt"}))
            .await
            .unwrap();

        let log = server.call_tool("git_log", json!({})).await.unwrap();
        match &log[0] {
            ToolContent::Text { text } => assert!(text.contains("add a.txt")),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_diff_reports_changes() {
        let (dir, server) = init_repo().await;
        tokio::fs::write(dir.path().join("a.txt"), "one\n")
            .await
            .unwrap();
        server
            .call_tool("git_add", json!({"paths": ["a.txt"]}))
            .await
            .unwrap();
        server
            .call_tool("git_commit", json!({"message": "base"}))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "two\n")
            .await
            .unwrap();

        let diff = server.call_tool("git_diff", json!({})).await.unwrap();
        match &diff[0] {
            ToolContent::Text { text } => assert!(text.contains("-one")),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_empty_message_rejected() {
        let (_dir, server) = init_repo().await;
        let err = server
            .call_tool("git_commit", json!({"message": "  "}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_add_empty_paths_rejected() {
        let (_dir, server) = init_repo().await;
        let err = server
            .call_tool("git_add", json!({"paths": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_outside_repo_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = GitServer::new(dir.path().to_path_buf());
        let err = server.call_tool("git_status", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
    }
}
