//! In-process [`ChatBackend`] for tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use alife_chat_proto::message::{ChatHistory, ChatId, ChatMessage, ItemId, UserId};

use super::{BackendError, ChatBackend};

/// Which endpoint an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Conversation lookup.
    Resolve,
    /// History fetch.
    History,
    /// Mark-as-read.
    MarkAsRead,
}

#[derive(Debug, Default)]
struct State {
    conversations: HashMap<(ItemId, UserId), ChatId>,
    histories: HashMap<ChatId, ChatHistory>,
    reads: Vec<(ChatId, UserId)>,
    failures: HashMap<Endpoint, VecDeque<BackendError>>,
}

/// Backend keeping conversations and histories in memory.
///
/// Failures can be queued per endpoint with [`fail_next`](Self::fail_next);
/// each queued error is returned once, in order, before normal service
/// resumes.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    token: Option<String>,
    resolve_calls: AtomicUsize,
    history_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

impl InMemoryBackend {
    /// Creates an empty backend that accepts any token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend that rejects every token but `token`.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Persists a message: links both participants to its conversation and
    /// appends it to the conversation's history.
    ///
    /// Messages without a chat id are ignored.
    pub fn record_message(&self, msg: &ChatMessage) {
        let Some(chat_id) = msg.chat_id.clone() else {
            return;
        };
        let mut state = self.state.lock();
        for user in [&msg.sender_id, &msg.recipient_id] {
            state
                .conversations
                .insert((msg.item_id.clone(), user.clone()), chat_id.clone());
        }
        state
            .histories
            .entry(chat_id)
            .or_default()
            .messages
            .push(msg.clone());
    }

    /// Sets the presence flag returned with a conversation's history.
    pub fn set_peer_online(&self, chat_id: &ChatId, online: bool) {
        self.state
            .lock()
            .histories
            .entry(chat_id.clone())
            .or_default()
            .peer_online = online;
    }

    /// Queues `error` to be returned by the next call to `endpoint`.
    pub fn fail_next(&self, endpoint: Endpoint, error: BackendError) {
        self.state
            .lock()
            .failures
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// Mark-as-read calls that succeeded, in order.
    #[must_use]
    pub fn reads(&self) -> Vec<(ChatId, UserId)> {
        self.state.lock().reads.clone()
    }

    /// Number of calls made to `endpoint`, including failed ones.
    #[must_use]
    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.counter(endpoint).load(Ordering::SeqCst)
    }

    const fn counter(&self, endpoint: Endpoint) -> &AtomicUsize {
        match endpoint {
            Endpoint::Resolve => &self.resolve_calls,
            Endpoint::History => &self.history_calls,
            Endpoint::MarkAsRead => &self.read_calls,
        }
    }

    /// Counts the call, then checks the token and any queued failure.
    fn begin(&self, endpoint: Endpoint, token: &str) -> Result<(), BackendError> {
        self.counter(endpoint).fetch_add(1, Ordering::SeqCst);

        if self.token.as_deref().is_some_and(|t| t != token) {
            return Err(BackendError::Unauthorized("token rejected".into()));
        }
        let queued = self
            .state
            .lock()
            .failures
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front);
        queued.map_or(Ok(()), Err)
    }
}

impl ChatBackend for InMemoryBackend {
    async fn resolve_conversation(
        &self,
        item: &ItemId,
        user: &UserId,
        token: &str,
    ) -> Result<Option<ChatId>, BackendError> {
        self.begin(Endpoint::Resolve, token)?;
        Ok(self
            .state
            .lock()
            .conversations
            .get(&(item.clone(), user.clone()))
            .cloned())
    }

    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        token: &str,
    ) -> Result<ChatHistory, BackendError> {
        self.begin(Endpoint::History, token)?;
        self.state
            .lock()
            .histories
            .get(chat_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("chat {chat_id}")))
    }

    async fn mark_as_read(
        &self,
        chat_id: &ChatId,
        user: &UserId,
        token: &str,
    ) -> Result<(), BackendError> {
        self.begin(Endpoint::MarkAsRead, token)?;
        self.state
            .lock()
            .reads
            .push((chat_id.clone(), user.clone()));
        Ok(())
    }
}
