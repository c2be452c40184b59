//! Permission broker
//!
//! Pauses a tool execution pending an out-of-band allow/deny decision.
//! The owning client's `can_use_tool` callback enqueues a request here and
//! awaits the response; a surface answers by request id. Remembered
//! patterns go to the durable allow-list, except for write-family tools
//! whose grants live only for the session.

use std::path::PathBuf;
use std::sync::Arc;

use glob::Pattern;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::error::{Error, Result};
use crate::settings::SettingsStore;

const REQUEST_CAPACITY: usize = 64;

/// A tool execution waiting for a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub request_id: String,
    pub agent_id: String,
    pub cwd: PathBuf,
    pub tool_name: String,
    pub tool_input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// The answer a surface returns for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub decision: PermissionDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Replacement tool input to execute instead of the original.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
    /// Pattern to remember on the allow-list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_pattern: Option<String>,
}

impl PermissionResponse {
    pub fn allow() -> Self {
        Self {
            decision: PermissionDecision::Allow,
            reason: None,
            updated_input: None,
            remember_pattern: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: PermissionDecision::Deny,
            reason: Some(reason.into()),
            updated_input: None,
            remember_pattern: None,
        }
    }

    pub fn with_updated_input(mut self, input: Value) -> Self {
        self.updated_input = Some(input);
        self
    }

    pub fn remembering(mut self, pattern: impl Into<String>) -> Self {
        self.remember_pattern = Some(pattern.into());
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == PermissionDecision::Allow
    }
}

/// Tools whose remembered grants must not outlive the session.
fn is_write_family(tool_name: &str) -> bool {
    matches!(tool_name, "Write" | "Edit" | "MultiEdit" | "NotebookEdit")
}

/// Match an allow-list pattern against a tool call.
///
/// Patterns are either a bare tool name (`Read`) or `Tool(arg-glob)` where
/// the glob is checked against the call's primary argument (`command` for
/// Bash, `file_path` for the file tools, the whole input as JSON
/// otherwise). `Bash(git *)` allows `git status` but not `rm -rf /`.
pub fn pattern_matches(pattern: &str, tool_name: &str, tool_input: &Value) -> bool {
    let (pattern_tool, arg_glob) = match pattern.split_once('(') {
        Some((tool, rest)) => match rest.strip_suffix(')') {
            Some(glob) => (tool, Some(glob)),
            None => (pattern, None),
        },
        None => (pattern, None),
    };
    if pattern_tool != tool_name {
        return false;
    }
    let Some(arg_glob) = arg_glob else {
        return true;
    };
    let argument = primary_argument(tool_name, tool_input);
    match Pattern::new(arg_glob) {
        Ok(glob) => glob.matches(&argument),
        Err(e) => {
            warn!("invalid allow-list pattern {:?}: {}", pattern, e);
            false
        }
    }
}

fn primary_argument(tool_name: &str, tool_input: &Value) -> String {
    let key = match tool_name {
        "Bash" => "command",
        "WebFetch" | "WebSearch" => "url",
        _ => "file_path",
    };
    match tool_input.get(key).and_then(Value::as_str) {
        Some(value) => value.to_string(),
        None => tool_input.to_string(),
    }
}

struct PendingRequest {
    request: PermissionRequest,
    reply: oneshot::Sender<PermissionResponse>,
}

/// FIFO broker for permission requests across a network's agents.
pub struct PermissionBroker {
    pending: parking_lot::Mutex<Vec<PendingRequest>>,
    requests: broadcast::Sender<PermissionRequest>,
    settings: parking_lot::RwLock<Option<Arc<SettingsStore>>>,
    session_patterns: parking_lot::Mutex<Vec<String>>,
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        let (requests, _) = broadcast::channel(REQUEST_CAPACITY);
        Self {
            pending: parking_lot::Mutex::new(Vec::new()),
            requests,
            settings: parking_lot::RwLock::new(None),
            session_patterns: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Bind the settings store remembered durable patterns are written to.
    pub fn bind_settings(&self, settings: Arc<SettingsStore>) {
        *self.settings.write() = Some(settings);
    }

    /// Subscribe to newly enqueued requests.
    pub fn subscribe(&self) -> broadcast::Receiver<PermissionRequest> {
        self.requests.subscribe()
    }

    /// Requests currently awaiting a decision, in arrival order.
    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.pending.lock().iter().map(|p| p.request.clone()).collect()
    }

    /// Patterns remembered for this session only (write-family tools).
    pub fn session_patterns(&self) -> Vec<String> {
        self.session_patterns.lock().clone()
    }

    /// Enqueue a request and block until a surface answers it.
    ///
    /// There is no timeout at this layer; closing the broker side of the
    /// rendezvous yields a deny.
    pub async fn request(&self, request: PermissionRequest) -> PermissionResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending
                .iter()
                .any(|p| p.request.agent_id == request.agent_id)
            {
                // The subprocess serializes permission requests per agent;
                // a second outstanding one indicates a protocol violation.
                warn!(
                    "agent {} already has an outstanding permission request",
                    request.agent_id
                );
            }
            pending.push(PendingRequest {
                request: request.clone(),
                reply: reply_tx,
            });
        }
        let _ = self.requests.send(request);

        match reply_rx.await {
            Ok(response) => response,
            Err(_) => PermissionResponse::deny("permission broker shut down"),
        }
    }

    /// Answer the pending request with `request_id`.
    ///
    /// An unknown id is reported as a protocol error and otherwise ignored.
    pub async fn respond(&self, request_id: &str, response: PermissionResponse) -> Result<()> {
        let pending = {
            let mut queue = self.pending.lock();
            match queue.iter().position(|p| p.request.request_id == request_id) {
                Some(index) => queue.remove(index),
                None => {
                    return Err(Error::Protocol(format!(
                        "permission response for unknown request {}",
                        request_id
                    )))
                }
            }
        };

        if response.is_allowed() {
            if let Some(pattern) = &response.remember_pattern {
                self.remember(&pending.request.tool_name, pattern).await;
            }
        }

        debug!(
            "permission {} for {}: {:?}",
            request_id, pending.request.tool_name, response.decision
        );
        let _ = pending.reply.send(response);
        Ok(())
    }

    async fn remember(&self, tool_name: &str, pattern: &str) {
        if is_write_family(tool_name) {
            let mut patterns = self.session_patterns.lock();
            if !patterns.iter().any(|p| p == pattern) {
                patterns.push(pattern.to_string());
            }
            return;
        }
        let settings = self.settings.read().clone();
        match settings {
            Some(settings) => {
                if let Err(e) = settings.add_allow_pattern(pattern).await {
                    warn!("failed to persist allow pattern {:?}: {}", pattern, e);
                }
            }
            None => {
                // No settings bound (e.g. a bare client outside a network);
                // fall back to session scope rather than dropping the grant.
                let mut patterns = self.session_patterns.lock();
                if !patterns.iter().any(|p| p == pattern) {
                    patterns.push(pattern.to_string());
                }
            }
        }
    }
}
