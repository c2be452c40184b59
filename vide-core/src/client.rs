//! Agent client
//!
//! Owns one agent: the subprocess, its protocol endpoint, the response
//! pump that folds decoded frames into the conversation store, and the
//! MCP servers the agent imports. One client per agent; the network
//! manager holds clients by id and never the other way around.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent_config::AgentConfig;
use crate::conversation::{Conversation, ConversationMessage, ConversationState};
use crate::decoder::{decode_frame, decode_transcript_entry};
use crate::error::{Error, Result};
use crate::mcp::{McpHost, McpServer};
use crate::process::{CliProcess, ProcessConfig};
use crate::processor::process;
use crate::protocol::{ControlProtocol, HookCallback, MessagePart, PermissionHandler};
use crate::response::{Response, Role, CODE_PROCESS_EXIT};
use crate::store::ConversationStore;

pub struct AgentClient {
    id: String,
    config: AgentConfig,
    process: Arc<CliProcess>,
    protocol: Arc<ControlProtocol>,
    store: Arc<ConversationStore>,
    mcp: McpHost,
    resumed: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("id", &self.id)
            .field("resumed", &self.resumed)
            .finish()
    }
}

impl AgentClient {
    /// Initialize a client: load any prior conversation from the CLI's
    /// session file, start the MCP servers (skipping already-running
    /// shared ones), then start the subprocess and attach the protocol.
    pub async fn create(
        config: AgentConfig,
        servers: Vec<Arc<dyn McpServer>>,
        hooks: Option<HashMap<String, HookCallback>>,
        can_use_tool: Option<PermissionHandler>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(ConversationStore::new());

        let mut resumed = false;
        if let Some(session_file) = &config.session_file {
            if session_file.exists() {
                match load_session_transcript(session_file).await {
                    Ok(conversation) if !conversation.messages.is_empty() => {
                        store.replace(conversation);
                        resumed = true;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Degrade to an empty conversation; the client
                        // still starts.
                        warn!("could not load prior conversation: {}", e);
                    }
                }
            }
        }

        let mcp = McpHost::new(servers);
        mcp.start_all()
            .await
            .map_err(|e| Error::Other(format!("failed to start MCP server: {}", e)))?;

        let process = Arc::new(CliProcess::new(ProcessConfig {
            command: config.cli_command.clone(),
            args: config.build_argv(),
            working_dir: config.working_dir.clone(),
            envs: config.envs.clone(),
        }));
        let protocol = Arc::new(ControlProtocol::new(
            config.agent_id.clone(),
            config.working_dir.clone(),
            process.outbound_sender(),
        ));
        if let Some(hooks) = hooks {
            protocol.register_hooks(hooks);
        }
        if let Some(handler) = can_use_tool {
            protocol.set_permission_callback(handler);
        }
        protocol.set_mcp_handler(Arc::new(mcp.clone()));

        let incoming = process
            .take_incoming()
            .ok_or_else(|| Error::Other("incoming frame stream already taken".to_string()))?;
        protocol.attach(incoming);

        let client = Arc::new(Self {
            id: config.agent_id.clone(),
            config,
            process,
            protocol,
            store,
            mcp,
            resumed,
            cancel: CancellationToken::new(),
        });
        client.spawn_response_pump();

        // Start failure fails create.
        client.process.ensure_started().await?;
        Ok(client)
    }

    fn spawn_response_pump(self: &Arc<Self>) {
        let client = self.clone();
        let mut messages = self.protocol.messages();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = messages.recv() => frame,
                };
                match frame {
                    Ok(frame) => {
                        for response in decode_frame(&frame) {
                            client.ingest(response);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("agent {} response pump lagged by {}", client.id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn ingest(&self, response: Response) {
        // An exit with no turn outstanding is routine shutdown, not an
        // error the conversation should surface.
        if let Response::Error { code, .. } = &response {
            if code.as_deref() == Some(CODE_PROCESS_EXIT)
                && self.store.current().state == ConversationState::Idle
            {
                warn!("agent {} subprocess exited while idle", self.id);
                return;
            }
        }
        self.store.apply(&response);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// True when a prior conversation was reconstructed at create time.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn conversation(&self) -> Conversation {
        self.store.current()
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Stream of conversation snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<Conversation> {
        self.store.subscribe()
    }

    /// Stream of turn completions.
    pub fn on_turn_complete(&self) -> broadcast::Receiver<Conversation> {
        self.store.subscribe_turns()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn is_aborting(&self) -> bool {
        self.process.is_aborting()
    }

    /// Send a plain-text user message. Empty messages are rejected.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::Config("cannot send an empty message".to_string()));
        }
        self.store
            .push_user_message(ConversationMessage::user(text));
        self.process.ensure_started().await?;
        self.protocol.send_user_message(text).await
    }

    /// Send a user message with structured content parts.
    pub async fn send_message_with_content(&self, parts: Vec<MessagePart>) -> Result<()> {
        if parts.is_empty() {
            return Err(Error::Config("cannot send an empty message".to_string()));
        }
        let text = parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        let attachments = parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Image { media_type, .. } => Some(media_type.clone()),
                MessagePart::Text { .. } => None,
            })
            .collect();
        self.store
            .push_user_message(ConversationMessage::user_with_attachments(text, attachments));
        self.process.ensure_started().await?;
        self.protocol.send_user_message_with_content(parts).await
    }

    /// Interrupt the current turn and bring the subprocess down, then
    /// record the interruption on the conversation.
    pub async fn abort(&self) -> Result<()> {
        let acked = self.protocol.interrupt().await.unwrap_or(false);
        if !acked {
            warn!("agent {} did not acknowledge interrupt", self.id);
        }
        self.process.abort().await?;
        self.store
            .apply(&Response::error("Interrupted by user", None, None));
        Ok(())
    }

    /// Stop the protocol, stop owned MCP servers (shared ones named in
    /// `keep_shared` are left running), and close the subprocess.
    pub async fn close(&self, keep_shared: &[String]) -> Result<()> {
        self.cancel.cancel();
        self.protocol.shutdown();
        self.mcp.stop_except(keep_shared).await;
        self.process.close().await
    }

    /// Look up an imported MCP server by name.
    pub fn mcp_server(&self, name: &str) -> Option<Arc<dyn McpServer>> {
        self.mcp.server(name)
    }

    /// Typed lookup by server name; `None` on a name or type mismatch.
    pub fn mcp_server_as<T: McpServer + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.mcp.server_as::<T>(name)
    }
}

/// Reconstruct a conversation from the CLI's own session transcript
/// (one JSON entry per line).
pub async fn load_session_transcript(path: &Path) -> Result<Conversation> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::ConversationLoad(e.to_string()))?;

    let mut conversation = Conversation::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| Error::ConversationLoad(format!("malformed transcript line: {}", e)))?;
        for response in decode_transcript_entry(&frame) {
            match &response {
                Response::Text {
                    role: Some(Role::User),
                    content,
                    ..
                } => {
                    conversation
                        .messages
                        .push(ConversationMessage::user(content.clone()));
                }
                Response::Status { .. } | Response::Meta { .. } | Response::Unknown { .. } => {}
                _ => {
                    conversation = process(&response, &conversation).conversation;
                }
            }
        }
    }

    // A reloaded transcript is history: nothing is streaming anymore.
    for message in &mut conversation.messages {
        if message.is_streaming {
            message.complete();
        }
    }
    conversation.state = ConversationState::Idle;
    conversation.current_error = None;
    Ok(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_config::AgentType;
    use std::path::PathBuf;
    use std::time::Duration;

    fn scripted_config(script: &str) -> AgentConfig {
        let mut config = AgentConfig::resolve(
            uuid::Uuid::new_v4().to_string(),
            AgentType::Main,
            "main",
            std::env::temp_dir(),
            &[],
        )
        .unwrap();
        config.cli_command = "sh".to_string();
        config.cli_args_override = Some(vec!["-c".to_string(), script.to_string()]);
        config.mcp_servers = Vec::new();
        config
    }

    const ECHO_HELLO: &str = r#"while IFS= read -r line; do
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":1}}}\n'
done"#;

    #[tokio::test]
    async fn test_simple_turn() {
        let client = AgentClient::create(scripted_config(ECHO_HELLO), vec![], None, None)
            .await
            .unwrap();
        let mut turns = client.on_turn_complete();

        client.send_message("hi").await.unwrap();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), turns.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].content, "hi");
        let reply = &snapshot.messages[1];
        assert_eq!(reply.content, "hello");
        assert!(reply.is_complete);
        assert!(!reply.is_streaming);
        assert_eq!(snapshot.total_input_tokens, 3);
        assert_eq!(snapshot.total_output_tokens, 1);
        assert_eq!(snapshot.state, ConversationState::Idle);

        client.close(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let client = AgentClient::create(scripted_config("cat > /dev/null"), vec![], None, None)
            .await
            .unwrap();
        let err = client.send_message("   ").await.unwrap_err();
        assert!(err.to_string().contains("empty"));
        client.close(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_fails_on_bad_command() {
        let mut config = scripted_config("cat");
        config.cli_command = "/definitely/not/a/binary".to_string();
        let err = AgentClient::create(config, vec![], None, None)
            .await
            .unwrap_err();
        assert!(err.is_process_start());
    }

    #[tokio::test]
    async fn test_abort_appends_interrupted_error() {
        let client = AgentClient::create(scripted_config("cat > /dev/null"), vec![], None, None)
            .await
            .unwrap();
        client.send_message("work on this").await.unwrap();

        tokio::time::timeout(Duration::from_secs(15), client.abort())
            .await
            .unwrap()
            .unwrap();

        let conversation = client.conversation();
        assert_eq!(conversation.state, ConversationState::Error);
        assert_eq!(
            conversation.current_error.as_deref(),
            Some("Interrupted by user")
        );
        let last = conversation.messages.last().unwrap();
        assert_eq!(last.error.as_deref(), Some("Interrupted by user"));
        client.close(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_session_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let lines = [
            r#"{"type":"user","message":{"content":[{"type":"text","text":"hi"}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":3,"output_tokens":1}}}"#,
            r#"{"type":"system","subtype":"init"}"#,
        ];
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let conversation = load_session_transcript(&path).await.unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[0].content, "hi");
        assert_eq!(conversation.messages[1].content, "hello");
        assert!(conversation.messages[1].is_complete);
        assert_eq!(conversation.state, ConversationState::Idle);
        assert_eq!(conversation.total_input_tokens, 3);
    }

    #[tokio::test]
    async fn test_load_session_transcript_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        tokio::fs::write(&path, "{broken").await.unwrap();

        let err = load_session_transcript(&path).await.unwrap_err();
        assert!(matches!(err, Error::ConversationLoad(_)));
    }

    #[tokio::test]
    async fn test_create_resumes_from_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        tokio::fs::write(
            &path,
            r#"{"type":"user","message":{"content":[{"type":"text","text":"earlier"}]}}"#,
        )
        .await
        .unwrap();

        let mut config = scripted_config("cat > /dev/null");
        config.session_file = Some(path);
        let client = AgentClient::create(config, vec![], None, None).await.unwrap();

        assert!(client.resumed());
        assert_eq!(client.conversation().messages[0].content, "earlier");
        client.close(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_survives_drifted_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        tokio::fs::write(&path, "not json at all").await.unwrap();

        let mut config = scripted_config("cat > /dev/null");
        config.session_file = Some(path);
        let client = AgentClient::create(config, vec![], None, None).await.unwrap();

        assert!(!client.resumed());
        assert!(client.conversation().messages.is_empty());
        client.close(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_sends_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("received");
        let script = format!(
            "while IFS= read -r line; do echo \"$line\" >> {}; done",
            sink.display()
        );
        let client = AgentClient::create(scripted_config(&script), vec![], None, None)
            .await
            .unwrap();

        client.send_message("first").await.unwrap();
        client.send_message("second").await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let contents = tokio::fs::read_to_string(&sink).await.unwrap_or_default();
            if contents.lines().count() == 2 {
                let lines: Vec<&str> = contents.lines().collect();
                assert!(lines[0].contains("first"));
                assert!(lines[1].contains("second"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "messages never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        client.close(&[]).await.unwrap();
    }
}
