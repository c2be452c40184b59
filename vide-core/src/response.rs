//! Typed responses decoded from the agent subprocess
//!
//! Every line the subprocess writes on stdout becomes one or more
//! [`Response`] values. The variants are a closed sum type with pure
//! constructors; the processor is a total function over them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error code attached to synthetic parse-failure responses.
pub const CODE_PARSE: &str = "PARSE";
/// Error code attached to synthetic unexpected-exit responses.
pub const CODE_PROCESS_EXIT: &str = "PROCESS_EXIT";

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Why the model stopped emitting output for the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other,
}

impl StopReason {
    /// Parse the wire string used by the subprocess.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            _ => Self::Other,
        }
    }

    /// True for every stop reason that ends the turn (everything except
    /// `tool_use`, which keeps the assistant message streaming).
    pub fn ends_turn(&self) -> bool {
        !matches!(self, Self::ToolUse)
    }
}

/// Token usage reported by the subprocess for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Extract usage from a raw `usage` object, if present and well-formed.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One typed response decoded from a subprocess frame.
///
/// `Text` carries the `stop_reason` and `usage` extracted from its raw
/// frame at decode time, so the processor never re-parses raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text {
        id: String,
        ts: DateTime<Utc>,
        content: String,
        /// True for streaming delta fragments, false for cumulative text.
        is_partial: bool,
        role: Option<Role>,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
    ToolUse {
        id: String,
        ts: DateTime<Utc>,
        tool_name: String,
        params: Value,
        tool_use_id: Option<String>,
    },
    ToolResult {
        id: String,
        ts: DateTime<Utc>,
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Completion {
        id: String,
        ts: DateTime<Utc>,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
        cost_usd: Option<f64>,
    },
    Error {
        id: String,
        ts: DateTime<Utc>,
        error: String,
        details: Option<String>,
        code: Option<String>,
    },
    Status {
        id: String,
        ts: DateTime<Utc>,
        raw: Value,
    },
    Meta {
        id: String,
        ts: DateTime<Utc>,
        raw: Value,
    },
    Unknown {
        id: String,
        ts: DateTime<Utc>,
        raw: Value,
    },
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Response {
    /// A cumulative or partial text block.
    pub fn text(content: impl Into<String>, is_partial: bool) -> Self {
        Self::Text {
            id: new_id(),
            ts: Utc::now(),
            content: content.into(),
            is_partial,
            role: Some(Role::Assistant),
            stop_reason: None,
            usage: None,
        }
    }

    /// A text block carrying end-of-message accounting.
    pub fn text_with_usage(
        content: impl Into<String>,
        is_partial: bool,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    ) -> Self {
        Self::Text {
            id: new_id(),
            ts: Utc::now(),
            content: content.into(),
            is_partial,
            role: Some(Role::Assistant),
            stop_reason,
            usage,
        }
    }

    pub fn tool_use(
        tool_name: impl Into<String>,
        params: Value,
        tool_use_id: Option<String>,
    ) -> Self {
        Self::ToolUse {
            id: new_id(),
            ts: Utc::now(),
            tool_name: tool_name.into(),
            params,
            tool_use_id,
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            id: new_id(),
            ts: Utc::now(),
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn completion(
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
        cost_usd: Option<f64>,
    ) -> Self {
        Self::Completion {
            id: new_id(),
            ts: Utc::now(),
            stop_reason,
            usage,
            cost_usd,
        }
    }

    pub fn error(
        error: impl Into<String>,
        details: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self::Error {
            id: new_id(),
            ts: Utc::now(),
            error: error.into(),
            details,
            code,
        }
    }

    pub fn status(raw: Value) -> Self {
        Self::Status {
            id: new_id(),
            ts: Utc::now(),
            raw,
        }
    }

    pub fn meta(raw: Value) -> Self {
        Self::Meta {
            id: new_id(),
            ts: Utc::now(),
            raw,
        }
    }

    pub fn unknown(raw: Value) -> Self {
        Self::Unknown {
            id: new_id(),
            ts: Utc::now(),
            raw,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Text { id, .. }
            | Self::ToolUse { id, .. }
            | Self::ToolResult { id, .. }
            | Self::Completion { id, .. }
            | Self::Error { id, .. }
            | Self::Status { id, .. }
            | Self::Meta { id, .. }
            | Self::Unknown { id, .. } => id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Text { ts, .. }
            | Self::ToolUse { ts, .. }
            | Self::ToolResult { ts, .. }
            | Self::Completion { ts, .. }
            | Self::Error { ts, .. }
            | Self::Status { ts, .. }
            | Self::Meta { ts, .. }
            | Self::Unknown { ts, .. } => *ts,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}
