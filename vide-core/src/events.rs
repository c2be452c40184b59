//! Event multiplexer
//!
//! Merges every agent's conversation stream into one ordered, attributed
//! timeline per network. Subscribers get a full-state snapshot first, then
//! deltas: new messages as `message`, text growth as `message_delta`
//! computed from the last emitted content length, tool uses and results as
//! they appear, plus status, error and done markers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent_config::AgentType;
use crate::conversation::{Conversation, ConversationState};
use crate::network::AgentStatus;
use crate::permission::PermissionRequest;
use crate::response::{Response, Role};
use crate::store::ConversationStore;

const EVENT_CAPACITY: usize = 1024;

/// Identity stamped on every event.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentAttribution {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub agent_name: String,
    pub task_name: Option<String>,
}

/// One event on the multiplexed timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvent {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Connected {},
    #[serde(rename_all = "camelCase")]
    Message {
        id: String,
        role: Role,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageDelta { id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        tool_name: String,
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        /// Resolved from the matching earlier tool_use.
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        content: String,
        is_error: bool,
    },
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_suggestions: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blocked_path: Option<String>,
    },
    Status { status: AgentStatus },
    Error { message: String },
    Done {},
}

#[derive(Default)]
struct AgentTracker {
    last_message_count: usize,
    last_content_length: usize,
    last_message_text: String,
    last_state: Option<ConversationState>,
    seen_tool_uses: HashMap<String, String>,
    seen_tool_results: HashSet<String>,
    errored: bool,
}

struct MuxInner {
    events: broadcast::Sender<NetworkEvent>,
    attribution: parking_lot::RwLock<HashMap<String, AgentAttribution>>,
    trackers: parking_lot::Mutex<HashMap<String, AgentTracker>>,
}

/// The per-network multiplexer. All agents in a network multiplex onto
/// one stream.
#[derive(Clone)]
pub struct EventMultiplexer {
    inner: Arc<MuxInner>,
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMultiplexer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MuxInner {
                events,
                attribution: parking_lot::RwLock::new(HashMap::new()),
                trackers: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register the attribution stamped on an agent's events.
    pub fn register_agent(&self, attribution: AgentAttribution) {
        self.inner
            .attribution
            .write()
            .insert(attribution.agent_id.clone(), attribution);
    }

    /// Follow a conversation store, ingesting every snapshot it publishes.
    pub fn attach(&self, agent_id: &str, store: &ConversationStore, cancel: CancellationToken) {
        let mux = self.clone();
        let agent_id = agent_id.to_string();
        let mut updates = store.subscribe();
        tokio::spawn(async move {
            loop {
                let snapshot = tokio::select! {
                    _ = cancel.cancelled() => break,
                    snapshot = updates.recv() => snapshot,
                };
                match snapshot {
                    Ok(snapshot) => mux.ingest(&agent_id, &snapshot),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("multiplexer lagged {} snapshots for {}", missed, agent_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Live subscription without a snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe and build the full-state snapshot: a `connected` event
    /// followed by a replay of every message and tool event of every
    /// given conversation, in order.
    pub fn subscribe_with_snapshot(
        &self,
        conversations: &[(String, Conversation)],
    ) -> (Vec<NetworkEvent>, broadcast::Receiver<NetworkEvent>) {
        let receiver = self.inner.events.subscribe();
        let mut snapshot = Vec::new();

        if let Some((first_agent, _)) = conversations.first() {
            snapshot.push(self.event(first_agent, EventPayload::Connected {}));
        }
        for (agent_id, conversation) in conversations {
            let mut tool_names: HashMap<String, String> = HashMap::new();
            for message in &conversation.messages {
                snapshot.push(self.event(
                    agent_id,
                    EventPayload::Message {
                        id: message.id.clone(),
                        role: message.role,
                        content: message.content.clone(),
                    },
                ));
                for response in &message.responses {
                    match response {
                        Response::ToolUse {
                            tool_name,
                            params,
                            tool_use_id,
                            ..
                        } => {
                            if let Some(id) = tool_use_id {
                                tool_names.insert(id.clone(), tool_name.clone());
                            }
                            snapshot.push(self.event(
                                agent_id,
                                EventPayload::ToolUse {
                                    tool_use_id: tool_use_id.clone(),
                                    tool_name: tool_name.clone(),
                                    params: params.clone(),
                                },
                            ));
                        }
                        Response::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                            ..
                        } => {
                            snapshot.push(self.event(
                                agent_id,
                                EventPayload::ToolResult {
                                    tool_use_id: tool_use_id.clone(),
                                    tool_name: tool_names.get(tool_use_id).cloned(),
                                    content: content.clone(),
                                    is_error: *is_error,
                                },
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }
        (snapshot, receiver)
    }

    /// Fold one conversation snapshot into the timeline.
    pub fn ingest(&self, agent_id: &str, conversation: &Conversation) {
        let mut events = Vec::new();
        {
            let mut trackers = self.inner.trackers.lock();
            let tracker = trackers.entry(agent_id.to_string()).or_default();

            // New messages, else growth of the trailing one.
            if conversation.messages.len() > tracker.last_message_count {
                for message in &conversation.messages[tracker.last_message_count..] {
                    events.push(EventPayload::Message {
                        id: message.id.clone(),
                        role: message.role,
                        content: message.content.clone(),
                    });
                }
            } else if let Some(last) = conversation.messages.last() {
                // Deltas come from the last emitted length, not the raw
                // frame, so cumulative duplicates never re-emit content.
                if last.content.len() > tracker.last_content_length {
                    events.push(EventPayload::MessageDelta {
                        id: last.id.clone(),
                        delta: last.content[tracker.last_content_length..].to_string(),
                    });
                }
            }

            // Newly appeared tool uses and results, across all messages.
            for message in &conversation.messages {
                for response in &message.responses {
                    match response {
                        Response::ToolUse {
                            id,
                            tool_name,
                            params,
                            tool_use_id,
                            ..
                        } => {
                            let key = tool_use_id.clone().unwrap_or_else(|| id.clone());
                            if tracker.seen_tool_uses.contains_key(&key) {
                                continue;
                            }
                            tracker.seen_tool_uses.insert(key, tool_name.clone());
                            events.push(EventPayload::ToolUse {
                                tool_use_id: tool_use_id.clone(),
                                tool_name: tool_name.clone(),
                                params: params.clone(),
                            });
                        }
                        Response::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                            ..
                        } => {
                            if !tracker.seen_tool_results.insert(tool_use_id.clone()) {
                                continue;
                            }
                            events.push(EventPayload::ToolResult {
                                tool_use_id: tool_use_id.clone(),
                                tool_name: tracker.seen_tool_uses.get(tool_use_id).cloned(),
                                content: content.clone(),
                                is_error: *is_error,
                            });
                        }
                        _ => {}
                    }
                }
            }

            // Error, once per occurrence.
            match &conversation.current_error {
                Some(message) if !tracker.errored => {
                    tracker.errored = true;
                    events.push(EventPayload::Error {
                        message: message.clone(),
                    });
                }
                Some(_) => {}
                None => tracker.errored = false,
            }

            // Turn boundary: a transition back to idle from an active
            // state. SendingMessage counts because a turn answered by a
            // single frame never publishes an intermediate
            // receivingResponse snapshot.
            let was_active = matches!(
                tracker.last_state,
                Some(ConversationState::SendingMessage)
                    | Some(ConversationState::ReceivingResponse)
                    | Some(ConversationState::Processing)
            );
            if was_active && conversation.state == ConversationState::Idle {
                events.push(EventPayload::Done {});
            }

            tracker.last_message_count = conversation.messages.len();
            if let Some(last) = conversation.messages.last() {
                tracker.last_content_length = last.content.len();
                tracker.last_message_text = last.content.clone();
            } else {
                tracker.last_content_length = 0;
                tracker.last_message_text.clear();
            }
            tracker.last_state = Some(conversation.state);
        }

        for payload in events {
            self.emit(agent_id, payload);
        }
    }

    /// Surface a pending permission request on the timeline.
    pub fn emit_permission_request(&self, request: &PermissionRequest) {
        self.emit(
            &request.agent_id,
            EventPayload::PermissionRequest {
                request_id: request.request_id.clone(),
                tool_name: request.tool_name.clone(),
                tool_input: request.tool_input.clone(),
                permission_suggestions: request.permission_suggestions.clone(),
                blocked_path: request.blocked_path.clone(),
            },
        );
    }

    /// Surface an agent status transition.
    pub fn emit_status(&self, agent_id: &str, status: AgentStatus) {
        self.emit(agent_id, EventPayload::Status { status });
    }

    fn emit(&self, agent_id: &str, payload: EventPayload) {
        let _ = self.inner.events.send(self.event(agent_id, payload));
    }

    fn event(&self, agent_id: &str, payload: EventPayload) -> NetworkEvent {
        let attribution = self.inner.attribution.read().get(agent_id).cloned();
        let attribution = attribution.unwrap_or_else(|| AgentAttribution {
            agent_id: agent_id.to_string(),
            agent_type: AgentType::UserDefined("unknown".to_string()),
            agent_name: agent_id.to_string(),
            task_name: None,
        });
        NetworkEvent {
            agent_id: attribution.agent_id,
            agent_type: attribution.agent_type,
            agent_name: attribution.agent_name,
            task_name: attribution.task_name,
            payload,
            timestamp: Utc::now(),
        }
    }
}
