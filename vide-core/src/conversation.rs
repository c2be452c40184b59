//! Immutable conversation snapshots
//!
//! A [`Conversation`] is a value: the processor produces a new snapshot for
//! every response, and the store publishes each replacement to subscribers.
//! Token totals are monotonically non-decreasing; the context window
//! reflects the most recent reported usage (replaced, not summed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::response::{Response, Role, Usage};
use crate::tool_call::{pair_invocations, ToolInvocation};

/// Where the conversation currently is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationState {
    Idle,
    SendingMessage,
    ReceivingResponse,
    Processing,
    Error,
}

/// Most recent context-window usage reported by the subprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindow {
    pub input: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl ContextWindow {
    pub fn from_usage(usage: &Usage) -> Self {
        Self {
            input: usage.input_tokens,
            cache_read: usage.cache_read_input_tokens,
            cache_creation: usage.cache_creation_input_tokens,
        }
    }

    /// Tokens currently occupying the model's window. Output tokens are
    /// excluded from the sum.
    pub fn window_total(&self) -> u64 {
        self.input + self.cache_read + self.cache_creation
    }
}

/// One message in the conversation, user or assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub ts: DateTime<Utc>,
    pub responses: Vec<Response>,
    pub attachments: Vec<String>,
    pub is_streaming: bool,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl ConversationMessage {
    /// A completed user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            ts: Utc::now(),
            responses: Vec::new(),
            attachments: Vec::new(),
            is_streaming: false,
            is_complete: true,
            error: None,
        }
    }

    pub fn user_with_attachments(content: impl Into<String>, attachments: Vec<String>) -> Self {
        Self {
            attachments,
            ..Self::user(content)
        }
    }

    /// A fresh assistant message that is still receiving responses.
    pub fn streaming_assistant() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            ts: Utc::now(),
            responses: Vec::new(),
            attachments: Vec::new(),
            is_streaming: true,
            is_complete: false,
            error: None,
        }
    }

    /// Recompute `content` from the collected text responses.
    ///
    /// Streaming fragments are authoritative: when any partial text exists,
    /// the concatenation of partials wins and cumulative copies are elided.
    pub fn recompute_content(&mut self) {
        let mut partials = String::new();
        let mut cumulative = String::new();
        let mut has_partial = false;
        for response in &self.responses {
            if let Response::Text {
                content,
                is_partial,
                ..
            } = response
            {
                if *is_partial {
                    has_partial = true;
                    partials.push_str(content);
                } else {
                    cumulative.push_str(content);
                }
            }
        }
        self.content = if has_partial { partials } else { cumulative };
    }

    /// Mark the message finished.
    pub fn complete(&mut self) {
        self.is_streaming = false;
        self.is_complete = true;
    }

    /// Tool invocations derived from this message's responses.
    pub fn tool_invocations(&self) -> Vec<ToolInvocation> {
        pair_invocations(&self.responses)
    }
}

/// Immutable snapshot of one agent's conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub messages: Vec<ConversationMessage>,
    pub state: ConversationState,
    pub current_error: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_input_tokens: u64,
    pub total_cache_creation_input_tokens: u64,
    pub current_context: ContextWindow,
    pub total_cost_usd: f64,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            state: ConversationState::Idle,
            current_error: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cache_read_input_tokens: 0,
            total_cache_creation_input_tokens: 0,
            current_context: ContextWindow::default(),
            total_cost_usd: 0.0,
        }
    }

    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    /// True when the trailing message is an assistant message still
    /// receiving responses.
    pub fn has_streaming_tail(&self) -> bool {
        self.messages
            .last()
            .map(|m| m.role == Role::Assistant && m.is_streaming)
            .unwrap_or(false)
    }

    /// Fold a usage report into the running totals and replace the
    /// context window with the latest reading.
    pub fn merge_usage(&mut self, usage: &Usage) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cache_read_input_tokens += usage.cache_read_input_tokens;
        self.total_cache_creation_input_tokens += usage.cache_creation_input_tokens;
        self.current_context = ContextWindow::from_usage(usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_is_complete() {
        let message = ConversationMessage::user("hi");
        assert_eq!(message.role, Role::User);
        assert!(message.is_complete);
        assert!(!message.is_streaming);
        assert_eq!(message.content, "hi");
    }

    #[test]
    fn test_streaming_assistant_starts_empty() {
        let message = ConversationMessage::streaming_assistant();
        assert_eq!(message.role, Role::Assistant);
        assert!(message.is_streaming);
        assert!(!message.is_complete);
        assert!(message.content.is_empty());
    }

    #[test]
    fn test_recompute_content_prefers_partials() {
        let mut message = ConversationMessage::streaming_assistant();
        message.responses.push(Response::text("A", true));
        message.responses.push(Response::text("B", true));
        message.responses.push(Response::text("C", true));
        // The cumulative duplicate of the same logical content is elided.
        message.responses.push(Response::text("ABC", false));
        message.recompute_content();
        assert_eq!(message.content, "ABC");
    }

    #[test]
    fn test_recompute_content_cumulative_only() {
        let mut message = ConversationMessage::streaming_assistant();
        message.responses.push(Response::text("hello ", false));
        message.responses.push(Response::text("world", false));
        message.recompute_content();
        assert_eq!(message.content, "hello world");
    }

    #[test]
    fn test_merge_usage_accumulates_and_replaces_context() {
        let mut conversation = Conversation::new();
        conversation.merge_usage(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_input_tokens: 100,
            cache_creation_input_tokens: 2,
        });
        conversation.merge_usage(&Usage {
            input_tokens: 3,
            output_tokens: 1,
            cache_read_input_tokens: 110,
            cache_creation_input_tokens: 0,
        });

        // Totals accumulate.
        assert_eq!(conversation.total_input_tokens, 13);
        assert_eq!(conversation.total_output_tokens, 6);
        assert_eq!(conversation.total_cache_read_input_tokens, 210);
        assert_eq!(conversation.total_cache_creation_input_tokens, 2);

        // Context reflects only the latest reading.
        assert_eq!(conversation.current_context.input, 3);
        assert_eq!(conversation.current_context.cache_read, 110);
        assert_eq!(conversation.current_context.window_total(), 113);
    }

    #[test]
    fn test_window_total_excludes_output() {
        let window = ContextWindow {
            input: 10,
            cache_read: 20,
            cache_creation: 5,
        };
        assert_eq!(window.window_total(), 35);
    }

    #[test]
    fn test_has_streaming_tail() {
        let mut conversation = Conversation::new();
        assert!(!conversation.has_streaming_tail());

        conversation.messages.push(ConversationMessage::user("hi"));
        assert!(!conversation.has_streaming_tail());

        conversation
            .messages
            .push(ConversationMessage::streaming_assistant());
        assert!(conversation.has_streaming_tail());

        conversation.messages.last_mut().unwrap().complete();
        assert!(!conversation.has_streaming_tail());
    }
}
