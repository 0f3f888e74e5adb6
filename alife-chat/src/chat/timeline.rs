//! Merges persisted history and live broker traffic into one timeline.
//!
//! [`Timeline`] holds no I/O. It keeps two lists:
//! - `history`: the last fetched snapshot, replaced wholesale
//! - `live`: messages accepted from the broker since the conversation was
//!   selected, append-only and unique by id
//!
//! The merged view is derived on every read: stable sort by timestamp, then
//! dedup by id keeping the first occurrence. History wins over live for the
//! same id because it comes first in the concatenation.

use std::collections::HashSet;

use alife_chat_proto::message::{ChatId, ChatMessage, ItemId, MessageId, UserId};

/// The `(item, counterpart)` pair a conversation view is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    /// Item under discussion.
    pub item_id: ItemId,
    /// The other participant.
    pub counterpart_id: UserId,
}

impl ConversationKey {
    /// Creates a key.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, counterpart_id: impl Into<UserId>) -> Self {
        Self {
            item_id: item_id.into(),
            counterpart_id: counterpart_id.into(),
        }
    }
}

/// Reconciled message state for one conversation view.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    own_id: Option<UserId>,
    key: Option<ConversationKey>,
    chat_id: Option<ChatId>,
    history: Vec<ChatMessage>,
    live: Vec<ChatMessage>,
    live_ids: HashSet<MessageId>,
}

impl Timeline {
    /// Creates an empty timeline with no conversation selected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signed-in user.
    pub fn set_own_id(&mut self, own_id: Option<UserId>) {
        self.own_id = own_id;
    }

    /// The signed-in user.
    #[must_use]
    pub const fn own_id(&self) -> Option<&UserId> {
        self.own_id.as_ref()
    }

    /// Selects the conversation about `key`.
    ///
    /// When the key differs from the current one, live messages, history and
    /// the known chat id are dropped so nothing leaks across conversations.
    /// Returns `true` if the conversation changed.
    pub fn select(&mut self, key: ConversationKey) -> bool {
        if self.key.as_ref() == Some(&key) {
            return false;
        }
        self.key = Some(key);
        self.chat_id = None;
        self.history.clear();
        self.live.clear();
        self.live_ids.clear();
        true
    }

    /// The selected conversation, if any.
    #[must_use]
    pub const fn key(&self) -> Option<&ConversationKey> {
        self.key.as_ref()
    }

    /// Records the resolved chat id of the selected conversation.
    pub fn set_chat_id(&mut self, chat_id: Option<ChatId>) {
        self.chat_id = chat_id;
    }

    /// The chat id of the selected conversation, once known.
    #[must_use]
    pub const fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }

    /// Replaces the persisted history snapshot.
    pub fn replace_history(&mut self, messages: Vec<ChatMessage>) {
        self.history = messages;
    }

    /// The persisted history snapshot.
    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Live messages accepted since the conversation was selected.
    #[must_use]
    pub fn live(&self) -> &[ChatMessage] {
        &self.live
    }

    /// Whether `msg` belongs to the selected conversation.
    ///
    /// The item must match, the participants must be exactly the signed-in
    /// user and the counterpart (either direction), and when both sides know
    /// a chat id the ids must agree.
    #[must_use]
    pub fn is_relevant(&self, msg: &ChatMessage) -> bool {
        let (Some(own), Some(key)) = (&self.own_id, &self.key) else {
            return false;
        };
        if msg.item_id != key.item_id || !msg.is_between(own, &key.counterpart_id) {
            return false;
        }
        match (&self.chat_id, &msg.chat_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Offers a broker message to the live list.
    ///
    /// Returns `true` if it was relevant and not already present.
    pub fn accept(&mut self, msg: ChatMessage) -> bool {
        if !self.is_relevant(&msg) || self.live_ids.contains(&msg.id) {
            return false;
        }
        self.live_ids.insert(msg.id.clone());
        self.live.push(msg);
        true
    }

    /// The merged, deduplicated, time-ordered view of the conversation.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        merge(&self.history, &self.live)
    }
}

/// Concatenates `history` and `live`, sorts stably by timestamp and keeps the
/// first occurrence of every id.
#[must_use]
pub fn merge(history: &[ChatMessage], live: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut all: Vec<&ChatMessage> = history.iter().chain(live).collect();
    all.sort_by_key(|m| m.timestamp);

    let mut seen = HashSet::with_capacity(all.len());
    all.into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .cloned()
        .collect()
}
