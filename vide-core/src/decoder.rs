//! Newline-delimited JSON frame decoding
//!
//! The subprocess writes one JSON object per line on stdout. The
//! [`FrameDecoder`] buffers raw bytes until a newline arrives, parses each
//! non-empty line, and reports malformed lines without aborting the stream.
//! [`decode_frame`] then turns one raw frame into typed [`Response`] values.

use log::warn;
use serde_json::Value;

use crate::response::{Response, Role, StopReason, Usage, CODE_PARSE};

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    /// A well-formed JSON object.
    Frame(Value),
    /// A line that failed to parse; the stream continues.
    Invalid { raw: String, error: String },
}

impl DecodedLine {
    /// Convert an invalid line into the synthetic parse-error response the
    /// owning client surfaces on its conversation.
    pub fn into_response(self) -> Option<Response> {
        match self {
            DecodedLine::Frame(_) => None,
            DecodedLine::Invalid { raw, error } => {
                Some(Response::error(error, Some(raw), Some(CODE_PARSE.into())))
            }
        }
    }
}

/// Incremental splitter and parser for the stdout byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every complete line decoded so far.
    ///
    /// Partial trailing lines stay buffered until the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(result) = Self::decode_line(&line[..line.len() - 1]) {
                decoded.push(result);
            }
        }
        decoded
    }

    /// Decode whatever remains in the buffer as a final unterminated line.
    pub fn finish(&mut self) -> Option<DecodedLine> {
        let rest = std::mem::take(&mut self.buffer);
        Self::decode_line(&rest)
    }

    fn decode_line(line: &[u8]) -> Option<DecodedLine> {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Some(DecodedLine::Frame(Value::Object(map))),
            Ok(other) => {
                warn!("dropping non-object frame: {}", other);
                Some(DecodedLine::Invalid {
                    raw: trimmed.to_string(),
                    error: "frame is not a JSON object".to_string(),
                })
            }
            Err(err) => Some(DecodedLine::Invalid {
                raw: trimmed.to_string(),
                error: format!("invalid JSON frame: {}", err),
            }),
        }
    }
}

/// Decode one raw frame into typed responses.
///
/// A single frame can yield several responses (an assistant message with
/// text and tool_use blocks). Unknown frame types yield
/// [`Response::Unknown`] carrying the raw data.
pub fn decode_frame(frame: &Value) -> Vec<Response> {
    match frame.get("type").and_then(Value::as_str) {
        Some("assistant") => decode_assistant(frame),
        Some("user") => decode_user(frame),
        Some("stream_event") => decode_stream_event(frame.get("event").unwrap_or(&Value::Null)),
        Some("content_block_delta") => decode_stream_event(frame),
        Some("result") => vec![decode_result(frame)],
        Some("system") => vec![Response::status(frame.clone())],
        Some("error") => vec![decode_error(frame)],
        _ => vec![Response::unknown(frame.clone())],
    }
}

fn message_usage(message: &Value) -> (Option<StopReason>, Option<Usage>) {
    let stop_reason = message
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(StopReason::parse);
    let usage = message
        .get("usage")
        .and_then(Usage::from_value)
        .filter(|u| !u.is_empty());
    (stop_reason, usage)
}

fn decode_assistant(frame: &Value) -> Vec<Response> {
    let Some(message) = frame.get("message") else {
        return vec![Response::unknown(frame.clone())];
    };
    let (stop_reason, usage) = message_usage(message);

    let mut responses = Vec::new();
    let mut last_text_index = None;
    let blocks = message
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                last_text_index = Some(responses.len());
                responses.push(Response::text(text, false));
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                let params = block.get("input").cloned().unwrap_or(Value::Null);
                let tool_use_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                responses.push(Response::tool_use(name, params, tool_use_id));
            }
            _ => {}
        }
    }

    // Accounting rides on the trailing text response; when the frame had
    // only tool_use blocks, synthesize an empty one to carry it.
    if stop_reason.is_some() || usage.is_some() {
        match last_text_index {
            Some(index) => {
                if let Response::Text {
                    stop_reason: sr,
                    usage: u,
                    ..
                } = &mut responses[index]
                {
                    *sr = stop_reason;
                    *u = usage;
                }
            }
            None => {
                responses.push(Response::text_with_usage("", false, stop_reason, usage));
            }
        }
    }

    if responses.is_empty() {
        vec![Response::meta(frame.clone())]
    } else {
        responses
    }
}

fn decode_user(frame: &Value) -> Vec<Response> {
    let blocks = frame
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut responses = Vec::new();
    for block in &blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            let tool_use_id = block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or("");
            let content = tool_result_text(block.get("content").unwrap_or(&Value::Null));
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            responses.push(Response::tool_result(tool_use_id, content, is_error));
        }
    }

    // Echoes of our own user turns carry no new conversation state.
    if responses.is_empty() {
        vec![Response::meta(frame.clone())]
    } else {
        responses
    }
}

/// Flatten tool-result content (string or content-block array) to text.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decode_stream_event(event: &Value) -> Vec<Response> {
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = event.get("delta").unwrap_or(&Value::Null);
            match delta.get("text").and_then(Value::as_str) {
                Some(text) => vec![Response::text(text, true)],
                None => vec![Response::meta(event.clone())],
            }
        }
        // message_delta closes the streamed message and may carry usage.
        Some("message_delta") => {
            let stop_reason = event
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
                .map(StopReason::parse);
            let usage = event
                .get("usage")
                .and_then(Usage::from_value)
                .filter(|u| !u.is_empty());
            if stop_reason.is_none() && usage.is_none() {
                vec![Response::meta(event.clone())]
            } else {
                vec![Response::text_with_usage("", true, stop_reason, usage)]
            }
        }
        _ => vec![Response::meta(event.clone())],
    }
}

fn decode_result(frame: &Value) -> Response {
    let stop_reason = frame
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(StopReason::parse);
    let usage = frame
        .get("usage")
        .and_then(Usage::from_value)
        .filter(|u| !u.is_empty());
    let cost_usd = frame
        .get("total_cost_usd")
        .or_else(|| frame.get("cost_usd"))
        .and_then(Value::as_f64);
    Response::completion(stop_reason, usage, cost_usd)
}

fn decode_error(frame: &Value) -> Response {
    let (message, code) = match frame.get("error") {
        Some(Value::Object(inner)) => (
            inner
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            inner
                .get("code")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        ),
        Some(Value::String(message)) => (message.clone(), None),
        _ => (
            frame
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            None,
        ),
    };
    let details = frame
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let code = code.or_else(|| {
        frame
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    });
    let exit_code = frame
        .get("error")
        .and_then(|e| e.get("exit_code"))
        .and_then(Value::as_i64);
    let details = details.or_else(|| exit_code.map(|c| format!("exit code {}", c)));
    Response::error(message, details, code)
}

/// Decode one raw frame, mapping a `Role` onto plain text frames.
///
/// Used by the session-transcript loader, which needs user text preserved
/// rather than treated as an echo.
pub fn decode_transcript_entry(frame: &Value) -> Vec<Response> {
    if frame.get("type").and_then(Value::as_str) == Some("user") {
        let mut responses = decode_user(frame);
        let blocks = frame
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for block in &blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                responses.push(Response::Text {
                    id: uuid::Uuid::new_v4().to_string(),
                    ts: chrono::Utc::now(),
                    content: text.to_string(),
                    is_partial: false,
                    role: Some(Role::User),
                    stop_reason: None,
                    usage: None,
                });
            }
        }
        // A plain string body is also observed for user entries.
        if responses.iter().all(|r| matches!(r, Response::Meta { .. })) {
            if let Some(text) = frame
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
            {
                responses.push(Response::Text {
                    id: uuid::Uuid::new_v4().to_string(),
                    ts: chrono::Utc::now(),
                    content: text.to_string(),
                    is_partial: false,
                    role: Some(Role::User),
                    stop_reason: None,
                    usage: None,
                });
            }
        }
        responses
    } else {
        decode_frame(frame)
    }
}
