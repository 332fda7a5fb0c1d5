//! In-memory conversation history, keyed by the client's `conversationId`.
//!
//! Nothing here is persisted; a restart forgets every conversation. Both the length of
//! one conversation and the number of conversations are bounded, and the bounds are
//! passed in on every call so runtime config changes apply immediately.

use crate::config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_messages: usize,
    pub max_conversations: usize,
}

impl HistoryLimits {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_messages: config.max_history_messages,
            max_conversations: config.max_conversations,
        }
    }
}

struct Conversation {
    messages: Vec<ChatMessage>,
    last_used: u64,
}

#[derive(Default)]
struct Store {
    conversations: HashMap<String, Conversation>,
    /// Logical clock for least-recently-used eviction.
    clock: u64,
}

impl Store {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Forget least recently used conversations until at most `keep` remain.
    fn evict_down_to(&mut self, keep: usize) {
        while self.conversations.len() > keep {
            let Some(oldest) = self
                .conversations
                .iter()
                .min_by_key(|(_, conversation)| conversation.last_used)
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            self.conversations.remove(&oldest);
        }
    }
}

#[derive(Default)]
pub struct ConversationHistory {
    store: Mutex<Store>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent messages of a conversation, oldest first.
    pub async fn messages(&self, conversation_id: &str, limits: HistoryLimits) -> Vec<ChatMessage> {
        let mut store = self.store.lock().await;
        let now = store.tick();
        let Some(conversation) = store.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        conversation.last_used = now;
        let skip = conversation.messages.len().saturating_sub(limits.max_messages);
        conversation.messages[skip..].to_vec()
    }

    /// Record one completed exchange. Oldest messages are dropped past the message limit,
    /// and the least recently used conversation is forgotten past the conversation limit.
    pub async fn record_exchange(&self, conversation_id: &str, user: &str, assistant: &str, limits: HistoryLimits) {
        let mut store = self.store.lock().await;
        let now = store.tick();

        if !store.conversations.contains_key(conversation_id) {
            store.evict_down_to(limits.max_conversations.saturating_sub(1));
        }

        let conversation = store
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                messages: Vec::new(),
                last_used: now,
            });
        conversation.last_used = now;
        conversation.messages.push(ChatMessage::new(Role::User, user));
        conversation.messages.push(ChatMessage::new(Role::Assistant, assistant));

        if conversation.messages.len() > limits.max_messages {
            let excess = conversation.messages.len() - limits.max_messages;
            conversation.messages.drain(..excess);
        }

        // A lowered limit shrinks the store on the next write.
        store.evict_down_to(limits.max_conversations);
    }

    pub async fn conversation_count(&self) -> usize {
        self.store.lock().await.conversations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_messages: usize, max_conversations: usize) -> HistoryLimits {
        HistoryLimits {
            max_messages,
            max_conversations,
        }
    }

    #[tokio::test]
    async fn test_history_is_per_conversation() {
        let history = ConversationHistory::new();
        history.record_exchange("a", "hello", "hi there", limits(10, 10)).await;

        let a = history.messages("a", limits(10, 10)).await;
        assert_eq!(a.len(), 2);
        assert_eq!(a[0], ChatMessage::new(Role::User, "hello"));
        assert_eq!(a[1], ChatMessage::new(Role::Assistant, "hi there"));
        assert!(history.messages("b", limits(10, 10)).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_drops_oldest_past_limit() {
        let history = ConversationHistory::new();
        history.record_exchange("c", "one", "1", limits(4, 10)).await;
        history.record_exchange("c", "two", "2", limits(4, 10)).await;
        history.record_exchange("c", "three", "3", limits(4, 10)).await;

        let messages = history.messages("c", limits(4, 10)).await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "two");
        assert_eq!(messages[3].content, "3");

        // A lower limit applies on read, before the next write trims storage.
        let recent = history.messages("c", limits(2, 10)).await;
        assert_eq!(recent[0].content, "three");
    }

    #[tokio::test]
    async fn test_rotating_ids_cannot_grow_past_conversation_limit() {
        let history = ConversationHistory::new();
        for n in 0..50 {
            history
                .record_exchange(&format!("conv-{}", n), "hi", "hello", limits(10, 3))
                .await;
        }

        assert_eq!(history.conversation_count().await, 3);
        assert!(history.messages("conv-0", limits(10, 3)).await.is_empty());
        assert_eq!(history.messages("conv-49", limits(10, 3)).await.len(), 2);
    }

    #[tokio::test]
    async fn test_least_recently_used_conversation_is_forgotten_first() {
        let history = ConversationHistory::new();
        history.record_exchange("old", "a", "b", limits(10, 2)).await;
        history.record_exchange("busy", "a", "b", limits(10, 2)).await;
        // Reading "old" makes "busy" the least recently used.
        history.messages("old", limits(10, 2)).await;

        history.record_exchange("new", "a", "b", limits(10, 2)).await;

        assert_eq!(history.messages("old", limits(10, 2)).await.len(), 2);
        assert!(history.messages("busy", limits(10, 2)).await.is_empty());
        assert_eq!(history.messages("new", limits(10, 2)).await.len(), 2);
    }
}
