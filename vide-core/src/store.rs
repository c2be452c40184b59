//! Conversation store
//!
//! Holds the current [`Conversation`] snapshot for one agent, publishes
//! every replacement in order, and exposes a separate turn-complete stream
//! so consumers can latch on turn boundaries without diffing snapshots.

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::conversation::{Conversation, ConversationMessage, ConversationState};
use crate::processor::process;
use crate::response::Response;

const UPDATE_CAPACITY: usize = 256;
const TURN_CAPACITY: usize = 32;

pub struct ConversationStore {
    current: RwLock<Conversation>,
    updates: broadcast::Sender<Conversation>,
    turns: broadcast::Sender<Conversation>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (turns, _) = broadcast::channel(TURN_CAPACITY);
        Self {
            current: RwLock::new(Conversation::new()),
            updates,
            turns,
        }
    }

    /// The latest snapshot.
    pub fn current(&self) -> Conversation {
        self.current.read().clone()
    }

    /// Subscribe to every snapshot replacement, in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<Conversation> {
        self.updates.subscribe()
    }

    /// Subscribe to turn completions; the payload is the snapshot at the
    /// moment the turn ended.
    pub fn subscribe_turns(&self) -> broadcast::Receiver<Conversation> {
        self.turns.subscribe()
    }

    /// Replace the whole conversation (used by resume).
    pub fn replace(&self, conversation: Conversation) {
        *self.current.write() = conversation.clone();
        let _ = self.updates.send(conversation);
    }

    /// Fold one response through the processor and publish the result.
    ///
    /// Returns true when the response completed the turn.
    pub fn apply(&self, response: &Response) -> bool {
        let mut guard = self.current.write();
        let outcome = process(response, &guard);
        *guard = outcome.conversation.clone();
        drop(guard);

        let _ = self.updates.send(outcome.conversation.clone());
        if outcome.turn_complete {
            let _ = self.turns.send(outcome.conversation);
        }
        outcome.turn_complete
    }

    /// Append a user message and move to `sendingMessage`.
    pub fn push_user_message(&self, message: ConversationMessage) {
        let mut guard = self.current.write();
        let mut updated = guard.clone();
        updated.messages.push(message);
        updated.state = ConversationState::SendingMessage;
        updated.current_error = None;
        *guard = updated.clone();
        drop(guard);
        let _ = self.updates.send(updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::StopReason;

    #[test]
    fn test_current_starts_empty_idle() {
        let store = ConversationStore::new();
        let conversation = store.current();
        assert!(conversation.messages.is_empty());
        assert_eq!(conversation.state, ConversationState::Idle);
    }

    #[tokio::test]
    async fn test_apply_publishes_snapshots_in_order() {
        let store = ConversationStore::new();
        let mut updates = store.subscribe();

        store.apply(&Response::text("a", true));
        store.apply(&Response::text("b", true));

        let first = updates.recv().await.unwrap();
        let second = updates.recv().await.unwrap();
        assert_eq!(first.messages[0].content, "a");
        assert_eq!(second.messages[0].content, "ab");
    }

    #[tokio::test]
    async fn test_turn_stream_fires_once_per_turn() {
        let store = ConversationStore::new();
        let mut turns = store.subscribe_turns();

        assert!(!store.apply(&Response::text("hel", true)));
        assert!(store.apply(&Response::text_with_usage(
            "hello",
            false,
            Some(StopReason::EndTurn),
            None
        )));

        let snapshot = turns.recv().await.unwrap();
        assert_eq!(snapshot.state, ConversationState::Idle);
        assert!(turns.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_user_message_sets_sending_state() {
        let store = ConversationStore::new();
        let mut updates = store.subscribe();

        store.push_user_message(ConversationMessage::user("hi"));

        let snapshot = updates.recv().await.unwrap();
        assert_eq!(snapshot.state, ConversationState::SendingMessage);
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "hi");
    }

    #[test]
    fn test_replace_overwrites_current() {
        let store = ConversationStore::new();
        let mut conversation = Conversation::new();
        conversation.messages.push(ConversationMessage::user("x"));
        store.replace(conversation);
        assert_eq!(store.current().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_push_user_message_clears_prior_error() {
        let store = ConversationStore::new();
        store.apply(&Response::error("boom", None, None));
        assert_eq!(store.current().state, ConversationState::Error);

        store.push_user_message(ConversationMessage::user("again"));
        let snapshot = store.current();
        assert!(snapshot.current_error.is_none());
        assert_eq!(snapshot.state, ConversationState::SendingMessage);
    }
}
