//! Response processor
//!
//! A pure reducer: `(Response, Conversation) -> (Conversation, turn
//! complete)`. All conversation mutation flows through here, so the rules
//! for streaming, tool pairing, accounting and error handling live in one
//! total function over the response variants.

use crate::conversation::{Conversation, ConversationMessage, ConversationState};
use crate::response::Response;

/// Result of folding one response into a conversation.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub conversation: Conversation,
    pub turn_complete: bool,
}

/// Fold one response into the conversation, producing a new snapshot.
pub fn process(response: &Response, conversation: &Conversation) -> ProcessOutcome {
    match response {
        Response::Text {
            stop_reason, usage, ..
        } => {
            let mut updated = conversation.clone();
            append_to_streaming_tail(&mut updated, response);
            updated.state = ConversationState::ReceivingResponse;

            // Usage merges only when the text carries a stop reason; a
            // bare usage reading mid-stream would double-count once the
            // cumulative copy of the same message arrives.
            if stop_reason.is_some() {
                if let Some(usage) = usage {
                    updated.merge_usage(usage);
                }
            }

            let mut turn_complete = false;
            if let Some(reason) = stop_reason {
                if reason.ends_turn() {
                    if let Some(message) = updated.messages.last_mut() {
                        message.complete();
                    }
                    updated.state = ConversationState::Idle;
                    turn_complete = true;
                }
            }
            ProcessOutcome {
                conversation: updated,
                turn_complete,
            }
        }

        Response::ToolUse { .. } => {
            let mut updated = conversation.clone();
            append_to_streaming_tail(&mut updated, response);
            updated.state = ConversationState::Processing;
            ProcessOutcome {
                conversation: updated,
                turn_complete: false,
            }
        }

        Response::ToolResult { .. } => {
            let mut updated = conversation.clone();
            append_to_streaming_tail(&mut updated, response);
            updated.state = ConversationState::Processing;
            ProcessOutcome {
                conversation: updated,
                turn_complete: false,
            }
        }

        Response::Completion {
            usage, cost_usd, ..
        } => {
            let mut updated = conversation.clone();
            if let Some(usage) = usage {
                updated.merge_usage(usage);
            }
            if let Some(cost) = cost_usd {
                updated.total_cost_usd += cost;
            }
            if let Some(message) = updated.messages.last_mut() {
                if message.is_streaming {
                    message.complete();
                }
            }
            updated.state = ConversationState::Idle;
            ProcessOutcome {
                conversation: updated,
                turn_complete: true,
            }
        }

        Response::Error { error, .. } => {
            let mut updated = conversation.clone();
            if !updated.has_streaming_tail() {
                updated
                    .messages
                    .push(ConversationMessage::streaming_assistant());
            }
            if let Some(message) = updated.messages.last_mut() {
                message.error = Some(error.clone());
                message.complete();
            }
            updated.state = ConversationState::Error;
            updated.current_error = Some(error.clone());
            ProcessOutcome {
                conversation: updated,
                turn_complete: true,
            }
        }

        Response::Status { .. } | Response::Meta { .. } | Response::Unknown { .. } => {
            ProcessOutcome {
                conversation: conversation.clone(),
                turn_complete: false,
            }
        }
    }
}

/// Append `response` to the trailing streaming assistant message,
/// creating one when the tail is absent or already complete.
fn append_to_streaming_tail(conversation: &mut Conversation, response: &Response) {
    if !conversation.has_streaming_tail() {
        conversation
            .messages
            .push(ConversationMessage::streaming_assistant());
    }
    let message = conversation
        .messages
        .last_mut()
        .expect("streaming tail was just ensured");
    message.responses.push(response.clone());
    message.recompute_content();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Response, Role, StopReason, Usage};
    use serde_json::json;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Usage::default()
        }
    }

    #[test]
    fn test_text_creates_streaming_message() {
        let conversation = Conversation::new();
        let outcome = process(&Response::text("hel", true), &conversation);

        assert_eq!(outcome.conversation.messages.len(), 1);
        let message = &outcome.conversation.messages[0];
        assert_eq!(message.role, Role::Assistant);
        assert!(message.is_streaming);
        assert_eq!(message.content, "hel");
        assert_eq!(
            outcome.conversation.state,
            ConversationState::ReceivingResponse
        );
        assert!(!outcome.turn_complete);
    }

    #[test]
    fn test_text_appends_to_streaming_tail() {
        let conversation = Conversation::new();
        let conversation = process(&Response::text("hel", true), &conversation).conversation;
        let outcome = process(&Response::text("lo", true), &conversation);

        assert_eq!(outcome.conversation.messages.len(), 1);
        assert_eq!(outcome.conversation.messages[0].content, "hello");
    }

    #[test]
    fn test_end_turn_text_completes_message_and_turn() {
        let conversation = Conversation::new();
        let response = Response::text_with_usage(
            "hello",
            false,
            Some(StopReason::EndTurn),
            Some(usage(3, 1)),
        );
        let outcome = process(&response, &conversation);

        let message = &outcome.conversation.messages[0];
        assert!(message.is_complete);
        assert!(!message.is_streaming);
        assert_eq!(message.content, "hello");
        assert_eq!(outcome.conversation.state, ConversationState::Idle);
        assert_eq!(outcome.conversation.total_input_tokens, 3);
        assert_eq!(outcome.conversation.total_output_tokens, 1);
        assert_eq!(outcome.conversation.current_context.input, 3);
        assert!(outcome.turn_complete);
    }

    #[test]
    fn test_tool_use_stop_reason_leaves_message_streaming() {
        let conversation = Conversation::new();
        let response = Response::text_with_usage(
            "reading",
            false,
            Some(StopReason::ToolUse),
            Some(usage(7, 2)),
        );
        let outcome = process(&response, &conversation);

        let message = &outcome.conversation.messages[0];
        assert!(message.is_streaming);
        assert!(!message.is_complete);
        assert_eq!(outcome.conversation.total_input_tokens, 7);
        assert!(!outcome.turn_complete);
    }

    #[test]
    fn test_usage_without_stop_reason_is_not_merged() {
        let conversation = Conversation::new();
        let response = Response::text_with_usage("x", true, None, Some(usage(5, 5)));
        let outcome = process(&response, &conversation);
        assert_eq!(outcome.conversation.total_input_tokens, 0);
    }

    #[test]
    fn test_tool_use_sets_processing_state() {
        let conversation = Conversation::new();
        let response = Response::tool_use("Read", json!({"file_path": "/a"}), Some("t1".into()));
        let outcome = process(&response, &conversation);

        assert_eq!(outcome.conversation.state, ConversationState::Processing);
        assert_eq!(outcome.conversation.messages.len(), 1);
        assert!(!outcome.turn_complete);
    }

    #[test]
    fn test_tool_result_pairs_with_tool_use() {
        let conversation = Conversation::new();
        let conversation = process(
            &Response::tool_use("Read", json!({"file_path": "/a"}), Some("t1".into())),
            &conversation,
        )
        .conversation;
        let outcome = process(&Response::tool_result("t1", "hello", false), &conversation);

        assert_eq!(outcome.conversation.state, ConversationState::Processing);
        let invocations = outcome.conversation.messages[0].tool_invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].is_complete());
        assert!(!invocations[0].is_error());
    }

    #[test]
    fn test_completion_accumulates_and_idles() {
        let conversation = Conversation::new();
        let conversation = process(&Response::text("hi", true), &conversation).conversation;
        let outcome = process(
            &Response::completion(Some(StopReason::EndTurn), Some(usage(10, 20)), Some(0.01)),
            &conversation,
        );

        assert!(outcome.turn_complete);
        assert_eq!(outcome.conversation.state, ConversationState::Idle);
        assert_eq!(outcome.conversation.total_output_tokens, 20);
        assert!((outcome.conversation.total_cost_usd - 0.01).abs() < f64::EPSILON);
        assert!(outcome.conversation.messages[0].is_complete);
    }

    #[test]
    fn test_error_marks_message_and_conversation() {
        let conversation = Conversation::new();
        let outcome = process(
            &Response::error("Interrupted by user", None, None),
            &conversation,
        );

        assert!(outcome.turn_complete);
        assert_eq!(outcome.conversation.state, ConversationState::Error);
        assert_eq!(
            outcome.conversation.current_error.as_deref(),
            Some("Interrupted by user")
        );
        let message = outcome.conversation.messages.last().unwrap();
        assert!(message.is_complete);
        assert_eq!(message.error.as_deref(), Some("Interrupted by user"));
    }

    #[test]
    fn test_error_attaches_to_existing_streaming_message() {
        let conversation = Conversation::new();
        let conversation = process(&Response::text("partial", true), &conversation).conversation;
        let outcome = process(&Response::error("boom", None, None), &conversation);

        assert_eq!(outcome.conversation.messages.len(), 1);
        assert_eq!(
            outcome.conversation.messages[0].error.as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn test_status_meta_unknown_are_noops() {
        let conversation = Conversation::new();
        for response in [
            Response::status(json!({"type": "system"})),
            Response::meta(json!({})),
            Response::unknown(json!({"type": "mystery"})),
        ] {
            let outcome = process(&response, &conversation);
            assert_eq!(outcome.conversation, conversation);
            assert!(!outcome.turn_complete);
        }
    }

    #[test]
    fn test_streaming_deltas_then_cumulative_duplicate() {
        // Deltas A, B, C then the cumulative copy "ABC" with end_turn:
        // the final content is "ABC", not "ABCABC".
        let mut conversation = Conversation::new();
        for fragment in ["A", "B", "C"] {
            conversation = process(&Response::text(fragment, true), &conversation).conversation;
        }
        let outcome = process(
            &Response::text_with_usage("ABC", false, Some(StopReason::EndTurn), Some(usage(3, 3))),
            &conversation,
        );

        assert_eq!(outcome.conversation.messages.len(), 1);
        assert_eq!(outcome.conversation.messages[0].content, "ABC");
        assert!(outcome.turn_complete);
    }

    #[test]
    fn test_completed_messages_never_stream() {
        // Invariant 1: is_complete implies not is_streaming, and at most
        // one trailing message streams.
        let mut conversation = Conversation::new();
        conversation.messages.push(ConversationMessage::user("hi"));
        conversation = process(&Response::text("a", true), &conversation).conversation;
        conversation = process(
            &Response::text_with_usage("a", false, Some(StopReason::EndTurn), None),
            &conversation,
        )
        .conversation;
        conversation = process(&Response::text("b", true), &conversation).conversation;

        let streaming: Vec<_> = conversation
            .messages
            .iter()
            .filter(|m| m.is_streaming)
            .collect();
        assert_eq!(streaming.len(), 1);
        assert!(std::ptr::eq(
            streaming[0],
            conversation.messages.last().unwrap()
        ));
        for message in &conversation.messages {
            assert!(!(message.is_complete && message.is_streaming));
        }
    }
}
