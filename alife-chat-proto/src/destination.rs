//! Broker destinations used by the private chat layer.

use crate::message::ChatId;

/// Default destination for ordinary chat messages.
pub const DEFAULT_SEND: &str = "/app/chat.sendMessage";

/// Default destination asking the broker to open a new conversation.
pub const DEFAULT_START_CONVERSATION: &str = "/app/chat.startConversation";

/// Default shared broadcast topic.
pub const DEFAULT_BROADCAST: &str = "/topic/public";

/// Default prefix of per-conversation topics.
pub const DEFAULT_CONVERSATION_PREFIX: &str = "/topic/chat.";

/// The set of destinations the client publishes and subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    /// Where ordinary chat messages are published.
    pub send: String,
    /// Where conversation-start requests are published.
    pub start_conversation: String,
    /// Shared broadcast topic every client subscribes to.
    pub broadcast: String,
    /// Prefix that, followed by a chat id, names a conversation topic.
    pub conversation_prefix: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            send: DEFAULT_SEND.to_string(),
            start_conversation: DEFAULT_START_CONVERSATION.to_string(),
            broadcast: DEFAULT_BROADCAST.to_string(),
            conversation_prefix: DEFAULT_CONVERSATION_PREFIX.to_string(),
        }
    }
}

impl Destinations {
    /// Returns the topic carrying traffic for one conversation.
    #[must_use]
    pub fn conversation_topic(&self, chat_id: &ChatId) -> String {
        format!("{}{chat_id}", self.conversation_prefix)
    }
}
