//! Flutter runtime server
//!
//! Manages one `flutter run` subprocess per network: launch, hot reload,
//! stop, and a rolling log buffer. VM-service extensions (screenshots,
//! taps) are outside this server's scope.

use std::any::Any;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::{McpServer, ToolContent, ToolDefinition, ToolError};

const MAX_LOG_LINES: usize = 2000;
const STOP_GRACE: Duration = Duration::from_secs(3);

struct RunningApp {
    child: Child,
    stdin: ChildStdin,
    logs: Arc<parking_lot::Mutex<Vec<String>>>,
}

pub struct FlutterRuntimeServer {
    working_dir: PathBuf,
    /// Command to launch; swapped out in tests.
    flutter_command: String,
    app: Mutex<Option<RunningApp>>,
    running: AtomicBool,
}

impl FlutterRuntimeServer {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            flutter_command: "flutter".to_string(),
            app: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_flutter_command(mut self, command: impl Into<String>) -> Self {
        self.flutter_command = command.into();
        self
    }

    async fn launch(&self, device_id: Option<&str>, target: Option<&str>) -> Result<String, ToolError> {
        let mut app = self.app.lock().await;
        if app.is_some() {
            return Err(ToolError::Execution(
                "an app is already running; stop it first".to_string(),
            ));
        }

        let mut command = Command::new(&self.flutter_command);
        command
            .arg("run")
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(device_id) = device_id {
            command.args(["-d", device_id]);
        }
        if let Some(target) = target {
            command.args(["-t", target]);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ToolError::Execution(format!("failed to launch flutter: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Execution("flutter process has no stdin".to_string()))?;

        let logs = Arc::new(parking_lot::Mutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_log(&logs, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_log(&logs, format!("[stderr] {}", line));
                }
            });
        }

        *app = Some(RunningApp { child, stdin, logs });
        Ok("App launched.".to_string())
    }

    async fn send_key(&self, key: &str) -> Result<(), ToolError> {
        let mut app = self.app.lock().await;
        let running = app
            .as_mut()
            .ok_or_else(|| ToolError::Execution("no app is running".to_string()))?;
        running
            .stdin
            .write_all(key.as_bytes())
            .await
            .map_err(|e| ToolError::Execution(format!("write to flutter stdin failed: {}", e)))?;
        running
            .stdin
            .flush()
            .await
            .map_err(|e| ToolError::Execution(format!("flush flutter stdin failed: {}", e)))
    }

    async fn stop_app(&self) -> Result<String, ToolError> {
        // Ask politely first; `q` is flutter run's quit key.
        if self.send_key("q").await.is_err() {
            return Ok("No app was running.".to_string());
        }
        let mut app = self.app.lock().await;
        let Some(mut running) = app.take() else {
            return Ok("No app was running.".to_string());
        };
        match tokio::time::timeout(STOP_GRACE, running.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(e) = running.child.kill().await {
                    warn!("killing flutter process failed: {}", e);
                }
            }
        }
        Ok("App stopped.".to_string())
    }

    async fn tail_logs(&self, limit: usize) -> Result<String, ToolError> {
        let app = self.app.lock().await;
        let running = app
            .as_ref()
            .ok_or_else(|| ToolError::Execution("no app is running".to_string()))?;
        let logs = running.logs.lock();
        let start = logs.len().saturating_sub(limit);
        Ok(logs[start..].join("\n"))
    }
}

fn push_log(logs: &Arc<parking_lot::Mutex<Vec<String>>>, line: String) {
    let mut logs = logs.lock();
    logs.push(line);
    let overflow = logs.len().saturating_sub(MAX_LOG_LINES);
    if overflow > 0 {
        logs.drain(..overflow);
    }
}

#[async_trait]
impl McpServer for FlutterRuntimeServer {
    fn name(&self) -> &str {
        "flutter-runtime"
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "launch_app",
                "Launch the app with flutter run in the working directory.",
                json!({
                    "type": "object",
                    "properties": {
                        "device_id": {"type": "string"},
                        "target": {"type": "string"}
                    }
                }),
            ),
            ToolDefinition::new(
                "hot_reload",
                "Hot-reload the running app.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::new(
                "stop_app",
                "Stop the running app.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolDefinition::new(
                "get_runtime_logs",
                "Return the tail of the running app's output.",
                json!({
                    "type": "object",
                    "properties": {"limit": {"type": "integer", "minimum": 1}}
                }),
            ),
        ]
    }

    async fn start(&self) -> Result<(), ToolError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ToolError> {
        let _ = self.stop_app().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Vec<ToolContent>, ToolError> {
        match tool {
            "launch_app" => {
                let device_id = args.get("device_id").and_then(Value::as_str);
                let target = args.get("target").and_then(Value::as_str);
                let message = self.launch(device_id, target).await?;
                Ok(vec![ToolContent::text(message)])
            }
            "hot_reload" => {
                self.send_key("r").await?;
                Ok(vec![ToolContent::text("Hot reload requested.")])
            }
            "stop_app" => {
                let message = self.stop_app().await?;
                Ok(vec![ToolContent::text(message)])
            }
            "get_runtime_logs" => {
                let limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(100)
                    .clamp(1, MAX_LOG_LINES as u64) as usize;
                let tail = self.tail_logs(limit).await?;
                if tail.is_empty() {
                    Ok(vec![ToolContent::text("No output yet.")])
                } else {
                    Ok(vec![ToolContent::text(tail)])
                }
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

    /// A stand-in binary: echoes stdin keys and prints a banner.
    fn fake_runtime(dir: &std::path::Path) -> FlutterRuntimeServer {
        // Ignores the "run" argument, prints a banner, and exits when
        // stdin closes or a q line arrives. Keys are sent without a
        // newline, so stop falls through to the kill path.
        let script = dir.join("fake-flutter");
        std::fs::write(
            &script,
            "#!/bin/sh\necho booting\nwhile IFS= read -r key; do\n  echo \"key:$key\"\n  [ \"$key\" = q ] && exit 0\ndone\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        FlutterRuntimeServer::new(dir.to_path_buf())
            .with_flutter_command(script.display().to_string())
    }

    #[tokio::test]
    async fn test_launch_reload_logs_stop() {
        let dir = tempfile::tempdir().unwrap();
        let server = fake_runtime(dir.path());
        server.start().await.unwrap();

        server.call_tool("launch_app", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        server.call_tool("hot_reload", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let logs = server
            .call_tool("get_runtime_logs", json!({"limit": 50}))
            .await
            .unwrap();
        match &logs[0] {
            ToolContent::Text { text } => assert!(text.contains("booting")),
            other => panic!("expected text, got {:?}", other),
        }

        let stopped = server.call_tool("stop_app", json!({})).await.unwrap();
        assert_eq!(stopped, vec![ToolContent::text("App stopped.")]);
    }

    #[tokio::test]
    async fn test_double_launch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = fake_runtime(dir.path());
        server.call_tool("launch_app", json!({})).await.unwrap();
        let err = server.call_tool("launch_app", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tools_require_running_app() {
        let dir = tempfile::tempdir().unwrap();
        let server = fake_runtime(dir.path());
        assert!(server.call_tool("hot_reload", json!({})).await.is_err());
        assert!(server
            .call_tool("get_runtime_logs", json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stop_without_app_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let server = fake_runtime(dir.path());
        let content = server.call_tool("stop_app", json!({})).await.unwrap();
        assert_eq!(content, vec![ToolContent::text("No app was running.")]);
    }
}
