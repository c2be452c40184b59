//! Control protocol
//!
//! The framed request/response dialogue with one agent subprocess over its
//! stdin/stdout. Outbound user turns are queued FIFO; inbound frames split
//! into conversation frames (fanned out to subscribers) and control
//! requests the subprocess asks the core to serve: permission decisions,
//! hook callbacks, and MCP messages for in-process servers.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::permission::{PermissionRequest, PermissionResponse};

const FRAME_CAPACITY: usize = 256;
const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);

/// One part of a structured outbound user message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text { text: String },
    Image { data: String, media_type: String },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    fn to_block(&self) -> Value {
        match self {
            Self::Text { text } => json!({"type": "text", "text": text}),
            Self::Image { data, media_type } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            }),
        }
    }
}

/// Callback invoked for `hook_callback` control requests, by callback id.
pub type HookCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Callback invoked for `can_use_tool` control requests.
pub type PermissionHandler =
    Arc<dyn Fn(PermissionRequest) -> BoxFuture<'static, PermissionResponse> + Send + Sync>;

/// Service for `mcp_message` control requests addressed to a named
/// in-process server.
#[async_trait::async_trait]
pub trait McpMessageHandler: Send + Sync {
    /// Handle one JSON-RPC message; `Value::Null` means no reply
    /// (notification).
    async fn handle(&self, server_name: &str, message: Value) -> Value;
}

/// The protocol endpoint owned by one agent client.
pub struct ControlProtocol {
    agent_id: String,
    cwd: PathBuf,
    outbound: mpsc::Sender<Value>,
    frames: broadcast::Sender<Value>,
    hooks: parking_lot::RwLock<HashMap<String, HookCallback>>,
    permission_handler: parking_lot::RwLock<Option<PermissionHandler>>,
    mcp_handler: parking_lot::RwLock<Option<Arc<dyn McpMessageHandler>>>,
    pending_interrupts: parking_lot::Mutex<HashMap<String, oneshot::Sender<()>>>,
    inflight_requests: Arc<parking_lot::Mutex<HashSet<String>>>,
    interrupt_timeout: Duration,
    cancel: CancellationToken,
}

impl ControlProtocol {
    /// Create a protocol writing outbound frames to `outbound`.
    pub fn new(agent_id: impl Into<String>, cwd: PathBuf, outbound: mpsc::Sender<Value>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            agent_id: agent_id.into(),
            cwd,
            outbound,
            frames,
            hooks: parking_lot::RwLock::new(HashMap::new()),
            permission_handler: parking_lot::RwLock::new(None),
            mcp_handler: parking_lot::RwLock::new(None),
            pending_interrupts: parking_lot::Mutex::new(HashMap::new()),
            inflight_requests: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            interrupt_timeout: DEFAULT_INTERRUPT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
        self.interrupt_timeout = timeout;
        self
    }

    /// Raw decoded frames received from the subprocess, control frames
    /// excluded.
    pub fn messages(&self) -> broadcast::Receiver<Value> {
        self.frames.subscribe()
    }

    /// Install hook callbacks by callback id. Must happen before the
    /// first turn.
    pub fn register_hooks(&self, hooks: HashMap<String, HookCallback>) {
        self.hooks.write().extend(hooks);
    }

    /// Install the permission callback. Must happen before the first turn.
    pub fn set_permission_callback(&self, handler: PermissionHandler) {
        *self.permission_handler.write() = Some(handler);
    }

    /// Install the MCP message service for in-process servers.
    pub fn set_mcp_handler(&self, handler: Arc<dyn McpMessageHandler>) {
        *self.mcp_handler.write() = Some(handler);
    }

    /// Enqueue a plain-text user turn.
    pub async fn send_user_message(&self, text: &str) -> Result<()> {
        self.send_user_message_with_content(vec![MessagePart::text(text)])
            .await
    }

    /// Enqueue a user turn with structured content parts.
    pub async fn send_user_message_with_content(&self, parts: Vec<MessagePart>) -> Result<()> {
        let blocks: Vec<Value> = parts.iter().map(MessagePart::to_block).collect();
        let frame = json!({
            "type": "user",
            "message": {"role": "user", "content": blocks}
        });
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::Protocol("subprocess channel closed".to_string()))
    }

    /// Send an interrupt and wait for its acknowledgement.
    ///
    /// Returns false when the subprocess did not acknowledge within the
    /// bounded wait; the caller escalates to a process kill.
    pub async fn interrupt(&self) -> Result<bool> {
        let request_id = Uuid::new_v4().to_string();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_interrupts
            .lock()
            .insert(request_id.clone(), ack_tx);

        let frame = json!({
            "type": "control_request",
            "request_id": request_id,
            "request": {"subtype": "interrupt"}
        });
        if self.outbound.send(frame).await.is_err() {
            self.pending_interrupts.lock().remove(&request_id);
            return Ok(false);
        }

        match tokio::time::timeout(self.interrupt_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) | Err(_) => {
                self.pending_interrupts.lock().remove(&request_id);
                Ok(false)
            }
        }
    }

    /// Stop serving; pending interrupt waits resolve unacknowledged.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.pending_interrupts.lock().clear();
    }

    /// Attach the inbound frame stream and start the pump.
    pub fn attach(self: &Arc<Self>, mut incoming: mpsc::Receiver<Value>) {
        let protocol = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = incoming.recv() => {
                        match frame {
                            Some(frame) => protocol.dispatch(frame),
                            None => break,
                        }
                    }
                }
            }
        });
    }

    fn dispatch(self: &Arc<Self>, frame: Value) {
        match frame.get("type").and_then(Value::as_str) {
            Some("control_response") => self.handle_control_response(&frame),
            Some("control_request") => self.handle_control_request(frame),
            Some("control_cancel_request") => {
                debug!("ignoring control_cancel_request");
            }
            _ => {
                let _ = self.frames.send(frame);
            }
        }
    }

    fn handle_control_response(&self, frame: &Value) {
        let request_id = frame
            .get("response")
            .and_then(|r| r.get("request_id"))
            .or_else(|| frame.get("request_id"))
            .and_then(Value::as_str);
        let Some(request_id) = request_id else {
            warn!("control_response without request_id dropped");
            return;
        };
        match self.pending_interrupts.lock().remove(request_id) {
            Some(ack) => {
                let _ = ack.send(());
            }
            None => warn!(
                "control_response for unknown request {} dropped",
                request_id
            ),
        }
    }

    fn handle_control_request(self: &Arc<Self>, frame: Value) {
        let Some(request_id) = frame
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!("control_request without request_id dropped");
            return;
        };

        // At most one outstanding callback per request id.
        {
            let mut inflight = self.inflight_requests.lock();
            if !inflight.insert(request_id.clone()) {
                warn!("duplicate control_request {} dropped", request_id);
                return;
            }
        }

        let protocol = self.clone();
        tokio::spawn(async move {
            let reply = protocol.serve_control_request(&request_id, &frame).await;
            protocol.inflight_requests.lock().remove(&request_id);
            let frame = match reply {
                Ok(payload) => json!({
                    "type": "control_response",
                    "response": {
                        "subtype": "success",
                        "request_id": request_id,
                        "response": payload,
                    }
                }),
                Err(message) => json!({
                    "type": "control_response",
                    "response": {
                        "subtype": "error",
                        "request_id": request_id,
                        "error": message,
                    }
                }),
            };
            // Replies share the outbound queue with user turns, so they
            // reach the subprocess in completion order.
            if protocol.outbound.send(frame).await.is_err() {
                debug!("dropping control reply {}: subprocess gone", request_id);
            }
        });
    }

    async fn serve_control_request(
        &self,
        request_id: &str,
        frame: &Value,
    ) -> std::result::Result<Value, String> {
        let request = frame.get("request").unwrap_or(&Value::Null);
        match request.get("subtype").and_then(Value::as_str) {
            Some("can_use_tool") => self.serve_permission(request_id, request).await,
            Some("hook_callback") => self.serve_hook(request).await,
            Some("mcp_message") => self.serve_mcp(request).await,
            other => Err(format!("unsupported control request: {:?}", other)),
        }
    }

    async fn serve_permission(
        &self,
        request_id: &str,
        request: &Value,
    ) -> std::result::Result<Value, String> {
        let handler = self
            .permission_handler
            .read()
            .clone()
            .ok_or_else(|| "no permission callback registered".to_string())?;

        let permission_request = PermissionRequest {
            request_id: request_id.to_string(),
            agent_id: self.agent_id.clone(),
            cwd: self.cwd.clone(),
            tool_name: request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            tool_input: request.get("input").cloned().unwrap_or(Value::Null),
            permission_suggestions: request
                .get("permission_suggestions")
                .and_then(Value::as_array)
                .map(|suggestions| {
                    suggestions
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                }),
            blocked_path: request
                .get("blocked_path")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        let response = handler(permission_request).await;
        if response.is_allowed() {
            let mut payload = json!({"behavior": "allow"});
            if let Some(updated) = response.updated_input {
                payload["updatedInput"] = updated;
            }
            Ok(payload)
        } else {
            Ok(json!({
                "behavior": "deny",
                "message": response.reason.unwrap_or_else(|| "denied".to_string()),
            }))
        }
    }

    async fn serve_hook(&self, request: &Value) -> std::result::Result<Value, String> {
        let callback_id = request
            .get("callback_id")
            .and_then(Value::as_str)
            .ok_or_else(|| "hook_callback without callback_id".to_string())?;
        let callback = self
            .hooks
            .read()
            .get(callback_id)
            .cloned()
            .ok_or_else(|| format!("unknown hook callback {}", callback_id))?;
        let input = request.get("input").cloned().unwrap_or(Value::Null);
        Ok(callback(input).await)
    }

    async fn serve_mcp(&self, request: &Value) -> std::result::Result<Value, String> {
        let handler = self
            .mcp_handler
            .read()
            .clone()
            .ok_or_else(|| "no MCP handler registered".to_string())?;
        let server_name = request
            .get("server_name")
            .and_then(Value::as_str)
            .ok_or_else(|| "mcp_message without server_name".to_string())?;
        let message = request.get("message").cloned().unwrap_or(Value::Null);
        let reply = handler.handle(server_name, message).await;
        Ok(json!({"mcp_response": reply}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        protocol: Arc<ControlProtocol>,
        incoming_tx: mpsc::Sender<Value>,
        outbound_rx: mpsc::Receiver<Value>,
    }

    fn harness() -> Harness {
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let protocol = Arc::new(
            ControlProtocol::new("agent-1", PathBuf::from("/work"), outbound_tx)
                .with_interrupt_timeout(Duration::from_millis(50)),
        );
        protocol.attach(incoming_rx);
        Harness {
            protocol,
            incoming_tx,
            outbound_rx,
        }
    }

    #[tokio::test]
    async fn test_user_message_frame_shape() {
        let mut h = harness();
        h.protocol.send_user_message("hi").await.unwrap();
        let frame = h.outbound_rx.recv().await.unwrap();
        assert_eq!(frame["type"], "user");
        assert_eq!(frame["message"]["role"], "user");
        assert_eq!(frame["message"]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_user_messages_stay_fifo() {
        let mut h = harness();
        h.protocol.send_user_message("one").await.unwrap();
        h.protocol.send_user_message("two").await.unwrap();
        let first = h.outbound_rx.recv().await.unwrap();
        let second = h.outbound_rx.recv().await.unwrap();
        assert_eq!(first["message"]["content"][0]["text"], "one");
        assert_eq!(second["message"]["content"][0]["text"], "two");
    }

    #[tokio::test]
    async fn test_conversation_frames_fan_out() {
        let h = harness();
        let mut messages = h.protocol.messages();
        h.incoming_tx
            .send(json!({"type": "assistant", "message": {"content": []}}))
            .await
            .unwrap();
        let frame = messages.recv().await.unwrap();
        assert_eq!(frame["type"], "assistant");
    }

    #[tokio::test]
    async fn test_can_use_tool_allow_reply() {
        let mut h = harness();
        h.protocol.set_permission_callback(Arc::new(|request| {
            Box::pin(async move {
                assert_eq!(request.tool_name, "Read");
                assert_eq!(request.agent_id, "agent-1");
                PermissionResponse::allow()
            })
        }));

        h.incoming_tx
            .send(json!({
                "type": "control_request",
                "request_id": "req-1",
                "request": {
                    "subtype": "can_use_tool",
                    "tool_name": "Read",
                    "input": {"file_path": "/a.txt"}
                }
            }))
            .await
            .unwrap();

        let reply = h.outbound_rx.recv().await.unwrap();
        assert_eq!(reply["type"], "control_response");
        assert_eq!(reply["response"]["subtype"], "success");
        assert_eq!(reply["response"]["request_id"], "req-1");
        assert_eq!(reply["response"]["response"]["behavior"], "allow");
    }

    #[tokio::test]
    async fn test_can_use_tool_deny_reply_carries_message() {
        let mut h = harness();
        h.protocol.set_permission_callback(Arc::new(|_| {
            Box::pin(async move { PermissionResponse::deny("nope") })
        }));

        h.incoming_tx
            .send(json!({
                "type": "control_request",
                "request_id": "req-2",
                "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {}}
            }))
            .await
            .unwrap();

        let reply = h.outbound_rx.recv().await.unwrap();
        assert_eq!(reply["response"]["response"]["behavior"], "deny");
        assert_eq!(reply["response"]["response"]["message"], "nope");
    }

    #[tokio::test]
    async fn test_duplicate_request_id_dropped() {
        let mut h = harness();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let gate_for_handler = gate.clone();
        h.protocol.set_permission_callback(Arc::new(move |_| {
            let gate = gate_for_handler.clone();
            Box::pin(async move {
                let _permit = gate.acquire().await;
                PermissionResponse::allow()
            })
        }));

        let request = json!({
            "type": "control_request",
            "request_id": "dup",
            "request": {"subtype": "can_use_tool", "tool_name": "Read", "input": {}}
        });
        h.incoming_tx.send(request.clone()).await.unwrap();
        h.incoming_tx.send(request).await.unwrap();
        gate.add_permits(2);

        let _reply = h.outbound_rx.recv().await.unwrap();
        // The duplicate was dropped, so only one reply ever arrives.
        let extra =
            tokio::time::timeout(Duration::from_millis(100), h.outbound_rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_hook_callback_by_id() {
        let mut h = harness();
        let mut hooks: HashMap<String, HookCallback> = HashMap::new();
        hooks.insert(
            "pre-tool".to_string(),
            Arc::new(|input| {
                Box::pin(async move { json!({"seen": input["tool_name"]}) })
            }),
        );
        h.protocol.register_hooks(hooks);

        h.incoming_tx
            .send(json!({
                "type": "control_request",
                "request_id": "req-3",
                "request": {
                    "subtype": "hook_callback",
                    "callback_id": "pre-tool",
                    "input": {"tool_name": "Write"}
                }
            }))
            .await
            .unwrap();

        let reply = h.outbound_rx.recv().await.unwrap();
        assert_eq!(reply["response"]["response"]["seen"], "Write");
    }

    #[tokio::test]
    async fn test_unknown_hook_is_error_reply() {
        let mut h = harness();
        h.incoming_tx
            .send(json!({
                "type": "control_request",
                "request_id": "req-4",
                "request": {"subtype": "hook_callback", "callback_id": "ghost"}
            }))
            .await
            .unwrap();

        let reply = h.outbound_rx.recv().await.unwrap();
        assert_eq!(reply["response"]["subtype"], "error");
    }

    #[tokio::test]
    async fn test_interrupt_acknowledged() {
        let mut h = harness();
        let protocol = h.protocol.clone();
        let waiting = tokio::spawn(async move { protocol.interrupt().await });

        let frame = h.outbound_rx.recv().await.unwrap();
        assert_eq!(frame["request"]["subtype"], "interrupt");
        let request_id = frame["request_id"].as_str().unwrap().to_string();

        h.incoming_tx
            .send(json!({
                "type": "control_response",
                "response": {"subtype": "success", "request_id": request_id}
            }))
            .await
            .unwrap();

        assert!(waiting.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_interrupt_timeout_reports_unacknowledged() {
        let h = harness();
        assert!(!h.protocol.interrupt().await.unwrap());
    }

    struct EchoMcp;

    #[async_trait::async_trait]
    impl McpMessageHandler for EchoMcp {
        async fn handle(&self, server_name: &str, message: Value) -> Value {
            json!({"server": server_name, "echo": message})
        }
    }

    #[tokio::test]
    async fn test_mcp_message_routed_to_handler() {
        let mut h = harness();
        h.protocol.set_mcp_handler(Arc::new(EchoMcp));

        h.incoming_tx
            .send(json!({
                "type": "control_request",
                "request_id": "req-5",
                "request": {
                    "subtype": "mcp_message",
                    "server_name": "memory",
                    "message": {"jsonrpc": "2.0", "id": 1, "method": "tools/list"}
                }
            }))
            .await
            .unwrap();

        let reply = h.outbound_rx.recv().await.unwrap();
        assert_eq!(
            reply["response"]["response"]["mcp_response"]["server"],
            "memory"
        );
    }
}
