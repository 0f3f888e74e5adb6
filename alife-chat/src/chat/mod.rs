//! Private conversation about one marketplace item.
//!
//! [`PrivateChat`] ties the pieces together for a UI:
//! - [`identity::ConversationResolver`] finds the chat id for the item
//! - [`history::HistoryLoader`] fetches persisted messages and presence
//! - [`crate::connection::ConnectionManager`] carries live traffic
//! - [`timeline::Timeline`] merges both into what the user sees
//!
//! The facade never returns errors to its caller. Failures land in the
//! [`error`](PrivateChat::error) slot and in `Option` return values.

pub mod history;
pub mod identity;
pub mod timeline;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use alife_chat_proto::message::{
    ChatId, ChatMessage, ItemId, MessageId, MessageType, OutgoingMessage, StartConversation,
    UserId, ValidationError, validate_content,
};

use crate::backend::{BackendError, ChatBackend};
use crate::config::{ConnectionConfig, HistoryConfig, ResolverConfig};
use crate::connection::{ConnectionError, ConnectionEvent, ConnectionManager};
use crate::session::Session;

use self::history::HistoryLoader;
use self::identity::{ConversationResolver, IdentityQuery};
use self::timeline::{ConversationKey, Timeline};

/// Errors raised inside the chat facade.
///
/// They are reported through [`PrivateChat::error`], never returned.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The session has no user id.
    #[error("no signed-in user")]
    MissingUser,

    /// No conversation has been opened.
    #[error("no conversation selected")]
    NoConversation,

    /// The message content was rejected.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The broker connection refused the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Identity or history lookup failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The conversation to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
    /// Item under discussion.
    pub item_id: ItemId,
    /// The other participant.
    pub counterpart_id: UserId,
    /// A chat id known up front, e.g. from a conversation list.
    pub chat_id: Option<ChatId>,
}

impl ChatTarget {
    /// A target whose chat id still has to be resolved.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, counterpart_id: impl Into<UserId>) -> Self {
        Self {
            item_id: item_id.into(),
            counterpart_id: counterpart_id.into(),
            chat_id: None,
        }
    }

    /// Sets a known chat id.
    #[must_use]
    pub fn with_chat_id(mut self, chat_id: impl Into<ChatId>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }
}

/// A message that was published but has not come back from the broker yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// Id returned by [`PrivateChat::send_message`].
    pub id: MessageId,
    /// Trimmed content that was sent.
    pub content: String,
}

/// What applying one connection event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    /// The broker connection is up.
    Connected,
    /// The broker connection went down.
    Disconnected,
    /// A new message joined the timeline.
    Message(ChatMessage),
    /// A message arrived that belongs to another conversation, or was
    /// already shown.
    Ignored,
    /// A connection error was reported.
    Error(String),
    /// A reconnect is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Reconnection was given up.
    ReconnectExhausted,
}

/// One open private conversation, as a UI sees it.
///
/// Must be created inside a tokio runtime: construction starts watching the
/// session, which connects as soon as a token is available unless
/// reconnection is disabled.
pub struct PrivateChat<B: ChatBackend> {
    connection: ConnectionManager,
    events: mpsc::Receiver<ConnectionEvent>,
    session: watch::Receiver<Session>,
    resolver: ConversationResolver<B>,
    history: HistoryLoader<B>,
    timeline: Timeline,
    explicit_chat_id: Option<ChatId>,
    peer_online: bool,
    is_loading: bool,
    error: Option<String>,
    pending: Vec<PendingSend>,
    sender_name: Option<String>,
}

impl<B: ChatBackend> PrivateChat<B> {
    /// Creates the chat and starts following `session`.
    #[must_use]
    pub fn new(
        connection: ConnectionConfig,
        resolver: ResolverConfig,
        history: HistoryConfig,
        backend: Arc<B>,
        session: watch::Receiver<Session>,
    ) -> Self {
        let (manager, events) = ConnectionManager::new(connection, session.clone());
        manager.watch_session();
        Self {
            connection: manager,
            events,
            session,
            resolver: ConversationResolver::new(Arc::clone(&backend), resolver),
            history: HistoryLoader::new(backend, history),
            timeline: Timeline::new(),
            explicit_chat_id: None,
            peer_online: false,
            is_loading: false,
            error: None,
            pending: Vec::new(),
            sender_name: None,
        }
    }

    /// Sets the display name attached to outgoing messages.
    pub fn set_sender_name(&mut self, name: Option<String>) {
        self.sender_name = name;
    }

    /// Shows the conversation about `target`, then resolves its chat id and
    /// loads its history.
    ///
    /// Switching to a different (item, counterpart) pair drops everything
    /// shown for the previous one first.
    pub async fn open(&mut self, target: ChatTarget) {
        self.sync_user();
        let key = ConversationKey {
            item_id: target.item_id,
            counterpart_id: target.counterpart_id,
        };
        if self.timeline.select(key) {
            tracing::debug!(key = ?self.timeline.key(), "switched conversation");
            self.connection.unsubscribe_conversation();
            self.pending.clear();
            self.peer_online = false;
            self.error = None;
        }
        self.explicit_chat_id = target.chat_id;
        self.refresh(false).await;
    }

    /// Reloads identity and history, bypassing the history cache.
    pub async fn load_chat_history(&mut self) {
        self.refresh(true).await;
    }

    /// Publishes `content` to the open conversation.
    ///
    /// The first message of a conversation (or any message while no chat id
    /// is known) asks the broker to start a conversation; later ones go to
    /// the known chat id. Nothing is added to the timeline until the broker
    /// echoes the message back.
    ///
    /// Returns the id generated for the message, or `None` (with
    /// [`error`](Self::error) set) when it could not be sent.
    pub fn send_message(&mut self, content: &str, is_first_message: bool) -> Option<MessageId> {
        match self.try_send(content, is_first_message) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(err = %e, "message not sent");
                if !matches!(e, ChatError::Connection(_)) {
                    self.error = Some(e.to_string());
                }
                None
            }
        }
    }

    fn try_send(&mut self, content: &str, is_first_message: bool) -> Result<MessageId, ChatError> {
        self.sync_user();
        let user = self.timeline.own_id().cloned().ok_or(ChatError::MissingUser)?;
        let key = self.timeline.key().cloned().ok_or(ChatError::NoConversation)?;
        let content = content.trim();
        validate_content(content)?;

        let id = MessageId::generate();
        match self.timeline.chat_id().cloned() {
            Some(chat_id) if !is_first_message => {
                self.connection.send_message(OutgoingMessage {
                    id: Some(id.clone()),
                    chat_id,
                    item_id: key.item_id,
                    sender_id: user,
                    sender_name: self.sender_name.clone(),
                    recipient_id: key.counterpart_id,
                    content: content.to_string(),
                    message_type: MessageType::Chat,
                })?;
            }
            known => {
                self.connection.start_conversation(&StartConversation {
                    item_id: key.item_id.clone(),
                    sender_id: user.clone(),
                    recipient_id: key.counterpart_id,
                    content: content.to_string(),
                })?;
                self.resolver.invalidate(&key.item_id, &user);
                match known {
                    Some(chat_id) => self.history.invalidate(&chat_id),
                    None => self.history.invalidate_all(),
                }
            }
        }

        self.pending.push(PendingSend {
            id: id.clone(),
            content: content.to_string(),
        });
        Ok(id)
    }

    /// Marks the open conversation as read, in the background.
    ///
    /// Does nothing until the chat id, user and token are known. Failures
    /// are only logged.
    pub fn mark_as_read(&mut self) -> Option<JoinHandle<()>> {
        self.sync_user();
        let chat_id = self.timeline.chat_id()?.clone();
        let user = self.timeline.own_id()?.clone();
        let token = self.session.borrow().token()?.to_string();
        Some(self.history.mark_as_read(chat_id, user, token))
    }

    /// Waits for the next connection event and applies it.
    ///
    /// Returns `None` once the connection manager is gone.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        let event = self.events.recv().await?;
        Some(self.apply(event))
    }

    /// Applies every connection event already queued, without waiting.
    ///
    /// Returns the updates in arrival order.
    pub fn drain_events(&mut self) -> Vec<ChatUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            updates.push(self.apply(event));
        }
        updates
    }

    fn apply(&mut self, event: ConnectionEvent) -> ChatUpdate {
        match event {
            ConnectionEvent::Opened => ChatUpdate::Connected,
            ConnectionEvent::Closed => ChatUpdate::Disconnected,
            ConnectionEvent::Error(e) => ChatUpdate::Error(e),
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                ChatUpdate::Reconnecting { attempt, delay }
            }
            ConnectionEvent::ReconnectExhausted => ChatUpdate::ReconnectExhausted,
            ConnectionEvent::Message(msg) => self.receive(msg),
        }
    }

    fn receive(&mut self, msg: ChatMessage) -> ChatUpdate {
        self.sync_user();
        if !self.timeline.accept(msg.clone()) {
            return ChatUpdate::Ignored;
        }

        if self.timeline.own_id() == Some(&msg.sender_id) {
            let position = self
                .pending
                .iter()
                .position(|p| p.id == msg.id)
                .or_else(|| self.pending.iter().position(|p| p.content == msg.content));
            if let Some(position) = position {
                self.pending.remove(position);
            }
        }

        if let (None, Some(chat_id)) = (self.timeline.chat_id(), msg.chat_id.clone()) {
            tracing::info!(chat_id = %chat_id, "conversation started");
            self.timeline.set_chat_id(Some(chat_id.clone()));
            self.connection.subscribe_conversation(chat_id);
        }
        ChatUpdate::Message(msg)
    }

    async fn refresh(&mut self, force: bool) {
        self.sync_user();
        let Some(key) = self.timeline.key().cloned() else {
            return;
        };
        self.is_loading = true;
        self.error = None;
        let token = self.session.borrow().token().map(str::to_owned);

        if let Some(chat_id) = self.explicit_chat_id.clone() {
            self.timeline.set_chat_id(Some(chat_id.clone()));
            self.connection.subscribe_conversation(chat_id);
        } else if let Some(user) = self.timeline.own_id().cloned() {
            let query = IdentityQuery {
                item_id: key.item_id,
                user_id: user,
                explicit_chat_id: None,
                enabled: true,
            };
            match self.resolver.resolve(&query, token.as_deref()).await {
                Ok(Some(chat_id)) => {
                    self.timeline.set_chat_id(Some(chat_id.clone()));
                    self.connection.subscribe_conversation(chat_id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(err = %e, "conversation lookup failed");
                    self.error = Some(ChatError::from(e).to_string());
                }
            }
        }

        let chat_id = self.timeline.chat_id().cloned();
        let loaded = if force {
            self.history.reload(chat_id.as_ref(), token.as_deref()).await
        } else {
            self.history.load(chat_id.as_ref(), token.as_deref()).await
        };
        match loaded {
            Ok(Some(history)) => {
                self.peer_online = history.peer_online;
                self.timeline.replace_history(history.messages);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(err = %e, "history load failed");
                self.error = Some(ChatError::from(e).to_string());
            }
        }
        self.is_loading = false;
    }

    fn sync_user(&mut self) {
        let user = self.session.borrow().user_id.clone();
        if self.timeline.own_id() != user.as_ref() {
            self.timeline.set_own_id(user);
        }
    }

    /// The merged, time-ordered conversation.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.timeline.messages()
    }

    /// Whether identity or history is being fetched.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// Whether the broker connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The current error: connection errors first, then lookup and send
    /// errors.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.connection.error().or_else(|| self.error.clone())
    }

    /// The chat id of the open conversation, once known.
    #[must_use]
    pub fn chat_id(&self) -> Option<&ChatId> {
        self.timeline.chat_id()
    }

    /// Counterpart presence from the last history load.
    #[must_use]
    pub const fn peer_online(&self) -> bool {
        self.peer_online
    }

    /// Sent messages still waiting for their echo.
    #[must_use]
    pub fn pending_sends(&self) -> &[PendingSend] {
        &self.pending
    }

    /// The underlying connection manager.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Connects to the broker now, for setups where reconnection (and with
    /// it connecting on sign-in) is disabled.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    /// Shuts the connection down for good.
    pub fn close(&self) {
        self.connection.shutdown();
    }
}
