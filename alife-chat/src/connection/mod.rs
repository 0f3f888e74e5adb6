//! Authenticated broker connection with automatic reconnection.
//!
//! [`ConnectionManager`] owns at most one STOMP session to the broker. It
//! subscribes to the broadcast topic and to the current conversation topic,
//! publishes chat messages, and reports everything that happens as
//! [`ConnectionEvent`]s on an `mpsc` channel.
//!
//! Unexpected drops (socket errors, closes, heart-beat loss, failed
//! handshakes) schedule a reconnect after `base_delay × 2^(attempt-1)`, up
//! to `max_attempts` times. An explicit [`disconnect`](ConnectionManager::disconnect)
//! turns reconnection off until the next [`connect`](ConnectionManager::connect).
//!
//! Every transport gets a generation number. Tasks belonging to a torn-down
//! transport compare their generation before touching shared state, so a
//! late close from an old socket can never knock over a newer one.

mod stomp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use alife_chat_proto::codec::{self, CodecError};
use alife_chat_proto::frame::{Command, Frame};
use alife_chat_proto::message::{
    ChatId, ChatMessage, MessageId, OutgoingMessage, StartConversation, Timestamp,
};

use crate::config::ConnectionConfig;
use crate::session::Session;

use self::stomp::{Inbound, WriterExit, WsReader};

/// Subscription id used for the broadcast topic.
const BROADCAST_SUBSCRIPTION: &str = "sub-0";

/// Errors reported by the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No bearer token is available to authenticate with.
    #[error("no access token available")]
    AuthUnavailable,

    /// The operation needs an established connection.
    #[error("not connected to the broker")]
    NotConnected,

    /// The manager was shut down and cannot be used again.
    #[error("connection manager is shut down")]
    ShutDown,

    /// The handshake did not complete in time.
    #[error("broker connection timed out")]
    Timeout,

    /// Socket or WebSocket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker reported a protocol error.
    #[error("broker error: {0}")]
    Protocol(String),

    /// A payload could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; subscriptions active.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Something the connection manager wants its owner to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed and subscriptions were issued.
    Opened,
    /// The transport went away.
    Closed,
    /// A transport or protocol error; also stored in the error slot.
    Error(String),
    /// A chat message arrived on a subscribed topic.
    Message(ChatMessage),
    /// A reconnect will be attempted after `delay`.
    ReconnectScheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// All reconnect attempts failed; the manager stays disconnected until
    /// [`ConnectionManager::connect`] is called.
    ReconnectExhausted,
}

/// Handles of the live transport.
struct ActiveLink {
    outbound: mpsc::UnboundedSender<Frame>,
    reader: Option<JoinHandle<()>>,
    conversation_sub: Option<String>,
    next_sub: u32,
}

impl ActiveLink {
    fn subscribe(&mut self, destination: &str) -> String {
        let id = format!("sub-{}", self.next_sub);
        self.next_sub += 1;
        let _ = self.outbound.send(codec::subscribe_frame(&id, destination));
        id
    }
}

#[derive(Default)]
struct Shared {
    state: ConnectionState,
    error: Option<String>,
    attempts: u32,
    auto_reconnect: bool,
    shut_down: bool,
    generation: u64,
    link: Option<ActiveLink>,
    reconnect_timer: Option<JoinHandle<()>>,
    session_watcher: Option<JoinHandle<()>>,
    conversation: Option<ChatId>,
}

/// Which side of a transport noticed it was gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LostBy {
    Handshake,
    Reader,
    Writer,
}

struct Inner {
    config: ConnectionConfig,
    session: watch::Receiver<Session>,
    events: mpsc::Sender<ConnectionEvent>,
    shared: Mutex<Shared>,
}

/// Owner of the broker connection.
///
/// Dropping the manager shuts it down: reconnection is disabled, the session
/// watcher stops and the transport is closed.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// The bearer token is read from `session` on every connect. Returns the
    /// manager and the receiver for its events.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        session: watch::Receiver<Session>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, rx) = mpsc::channel(config.event_buffer.max(1));
        let shared = Shared {
            auto_reconnect: config.reconnect.enabled,
            ..Shared::default()
        };
        let inner = Arc::new(Inner {
            config,
            session,
            events,
            shared: Mutex::new(shared),
        });
        (Self { inner }, rx)
    }

    /// Opens the connection if it is not already open or opening.
    ///
    /// Re-enables automatic reconnection (when configured) and resets the
    /// attempt counter.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::AuthUnavailable`] if the session has no token.
    /// - [`ConnectionError::ShutDown`] after [`shutdown`](Self::shutdown).
    /// - Any handshake failure; a reconnect is scheduled for those.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.connect().await
    }

    /// Closes the connection and disables automatic reconnection.
    ///
    /// Cancels a pending reconnect and resets the attempt counter. Calling it
    /// while already disconnected is a no-op.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Publishes a chat message to the send destination.
    ///
    /// The message is stamped with the current time and, unless the draft
    /// carries one, a fresh id. It is not retried.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless connected, or
    /// [`ConnectionError::Codec`] if it cannot be encoded. Errors are also
    /// stored in the error slot and emitted as [`ConnectionEvent::Error`].
    pub fn send_message(&self, draft: OutgoingMessage) -> Result<MessageId, ConnectionError> {
        let Some(outbound) = self.inner.outbound() else {
            return Err(self.inner.fail(ConnectionError::NotConnected));
        };

        let msg = draft.stamp(Timestamp::now());
        let frame = codec::send_frame(&self.inner.config.destinations.send, &msg)
            .map_err(|e| self.inner.fail(e.into()))?;
        outbound
            .send(frame)
            .map_err(|_| self.inner.fail(ConnectionError::NotConnected))?;

        tracing::debug!(id = %msg.id, chat_id = ?msg.chat_id, "published chat message");
        Ok(msg.id)
    }

    /// Asks the broker to open a new conversation with `draft` as its first
    /// message.
    ///
    /// # Errors
    ///
    /// Same as [`send_message`](Self::send_message).
    pub fn start_conversation(&self, draft: &StartConversation) -> Result<(), ConnectionError> {
        let Some(outbound) = self.inner.outbound() else {
            return Err(self.inner.fail(ConnectionError::NotConnected));
        };

        let frame = codec::send_frame(&self.inner.config.destinations.start_conversation, draft)
            .map_err(|e| self.inner.fail(e.into()))?;
        outbound
            .send(frame)
            .map_err(|_| self.inner.fail(ConnectionError::NotConnected))?;

        tracing::debug!(
            item = %draft.item_id,
            recipient = %draft.recipient_id,
            "requested new conversation"
        );
        Ok(())
    }

    /// Follows the topic of `chat_id`, replacing any previous conversation.
    ///
    /// Takes effect immediately when connected, and is re-issued on every
    /// reconnect.
    pub fn subscribe_conversation(&self, chat_id: ChatId) {
        let topic = self.inner.config.destinations.conversation_topic(&chat_id);
        let mut shared = self.inner.shared.lock();
        let already = shared.conversation.as_ref() == Some(&chat_id);
        if already
            && shared
                .link
                .as_ref()
                .is_none_or(|link| link.conversation_sub.is_some())
        {
            return;
        }
        shared.conversation = Some(chat_id);
        if let Some(link) = shared.link.as_mut() {
            if let Some(old) = link.conversation_sub.take() {
                let _ = link.outbound.send(codec::unsubscribe_frame(&old));
            }
            link.conversation_sub = Some(link.subscribe(&topic));
            tracing::debug!(topic = %topic, "subscribed to conversation");
        }
    }

    /// Stops following the current conversation topic.
    pub fn unsubscribe_conversation(&self) {
        let mut shared = self.inner.shared.lock();
        shared.conversation = None;
        let Some(link) = shared.link.as_mut() else {
            return;
        };
        if let Some(old) = link.conversation_sub.take() {
            let _ = link.outbound.send(codec::unsubscribe_frame(&old));
        }
    }

    /// Reacts to session changes in the background.
    ///
    /// When a token becomes available the manager connects, if reconnection
    /// is enabled in configuration; when it goes away the manager
    /// disconnects. A token already present when this is called counts as
    /// becoming available.
    pub fn watch_session(&self) {
        let inner = Arc::clone(&self.inner);
        let mut session = self.inner.session.clone();
        let auto_connect = self.inner.config.reconnect.enabled;
        let handle = tokio::spawn(async move {
            let mut had_token = session.borrow_and_update().token().is_some();
            if had_token && auto_connect {
                let _ = inner.connect().await;
            }
            while session.changed().await.is_ok() {
                let (has_token, loading) = {
                    let current = session.borrow_and_update();
                    (current.token().is_some(), current.is_loading)
                };
                if loading {
                    continue;
                }
                if has_token && !had_token {
                    if auto_connect {
                        tracing::info!("session token available, connecting");
                        let _ = inner.connect().await;
                    } else {
                        tracing::debug!("session token available, reconnection disabled");
                    }
                } else if !has_token && had_token {
                    tracing::info!("session token gone, disconnecting");
                    inner.disconnect();
                }
                had_token = has_token;
            }
        });

        let mut shared = self.inner.shared.lock();
        if shared.shut_down {
            handle.abort();
        } else if let Some(old) = shared.session_watcher.replace(handle) {
            old.abort();
        }
    }

    /// Permanently tears the manager down, whatever its state.
    pub fn shutdown(&self) {
        let watcher = {
            let mut shared = self.inner.shared.lock();
            shared.shut_down = true;
            shared.session_watcher.take()
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.inner.disconnect();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The last transport or protocol error, cleared on successful connect.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner.shared.lock().error.clone()
    }

    /// Clears the error slot.
    pub fn clear_error(&self) {
        self.inner.shared.lock().error = None;
    }

    /// Consecutive reconnect attempts since the last successful connect.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.shared.lock().attempts
    }

    /// The conversation whose topic is followed.
    #[must_use]
    pub fn conversation(&self) -> Option<ChatId> {
        self.inner.shared.lock().conversation.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let auth = {
            let mut shared = self.shared.lock();
            if shared.shut_down {
                return Err(ConnectionError::ShutDown);
            }
            if shared.state != ConnectionState::Disconnected {
                return Ok(());
            }
            shared.auto_reconnect = self.config.reconnect.enabled;
            shared.attempts = 0;
            if let Some(timer) = shared.reconnect_timer.take() {
                timer.abort();
            }
            let token = self.session.borrow().token().map(str::to_owned);
            token.map(|token| {
                shared.state = ConnectionState::Connecting;
                shared.generation += 1;
                (token, shared.generation)
            })
        };

        let Some((token, generation)) = auth else {
            tracing::warn!("cannot connect to broker without an access token");
            return Err(self.fail(ConnectionError::AuthUnavailable));
        };
        tracing::info!(url = %self.config.url, "connecting to broker");
        self.establish(generation, &token).await
    }

    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        token: &str,
    ) -> Result<(), ConnectionError> {
        match stomp::open(&self.config, token).await {
            Ok(link) => {
                self.activate(generation, link).await;
                Ok(())
            }
            Err(e) => {
                self.link_lost(generation, Some(e.to_string()), LostBy::Handshake)
                    .await;
                Err(e)
            }
        }
    }

    /// Installs a handshaken transport, unless it was superseded meanwhile.
    async fn activate(self: &Arc<Self>, generation: u64, link: stomp::Link) {
        let stomp::Link {
            sink,
            reader,
            heart_beat,
        } = link;
        let destinations = &self.config.destinations;

        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.shut_down {
                tracing::debug!(generation, "discarding superseded broker connection");
                return;
            }
            let (outbound, rx) = mpsc::unbounded_channel();
            let _ = outbound.send(codec::subscribe_frame(
                BROADCAST_SUBSCRIPTION,
                &destinations.broadcast,
            ));
            let mut active = ActiveLink {
                outbound,
                reader: None,
                conversation_sub: None,
                next_sub: 1,
            };
            if let Some(chat_id) = &shared.conversation {
                active.conversation_sub =
                    Some(active.subscribe(&destinations.conversation_topic(chat_id)));
            }
            tokio::spawn(Arc::clone(self).writer_task(
                generation,
                sink,
                rx,
                heart_beat.send_every,
            ));

            shared.link = Some(active);
            shared.state = ConnectionState::Connected;
            shared.error = None;
            shared.attempts = 0;
        }

        self.emit(ConnectionEvent::Opened).await;

        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return;
        }
        let handle = tokio::spawn(Arc::clone(self).reader_task(
            generation,
            reader,
            heart_beat.expect_every,
        ));
        if let Some(active) = shared.link.as_mut() {
            active.reader = Some(handle);
        }
    }

    async fn writer_task(
        self: Arc<Self>,
        generation: u64,
        sink: stomp::WsSink,
        rx: mpsc::UnboundedReceiver<Frame>,
        send_every: Option<Duration>,
    ) {
        if let WriterExit::Failed(reason) = stomp::writer_loop(sink, rx, send_every).await {
            self.link_lost(generation, Some(reason), LostBy::Writer).await;
        }
    }

    async fn reader_task(
        self: Arc<Self>,
        generation: u64,
        mut reader: WsReader,
        expect_every: Option<Duration>,
    ) {
        loop {
            let frame = match stomp::next_inbound(&mut reader, expect_every).await {
                Inbound::Frame(frame) => frame,
                Inbound::Lost(reason) => {
                    self.link_lost(generation, reason, LostBy::Reader).await;
                    return;
                }
            };
            match frame.command {
                Command::Message => match codec::decode_message(&frame) {
                    Ok(msg) => {
                        if !self.is_current(generation) {
                            return;
                        }
                        if self.events.send(ConnectionEvent::Message(msg)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            err = %e,
                            destination = frame.get_header("destination").unwrap_or_default(),
                            "undecodable chat message, skipping"
                        );
                    }
                },
                Command::Error => {
                    let reason = codec::describe_error(&frame);
                    tracing::warn!(reason = %reason, "broker reported an error");
                    if !self.is_current(generation) {
                        return;
                    }
                    self.shared.lock().error = Some(reason.clone());
                    self.emit(ConnectionEvent::Error(reason)).await;
                }
                Command::Receipt => {
                    tracing::trace!(receipt = ?frame.get_header("receipt-id"), "receipt");
                }
                other => {
                    tracing::debug!(command = %other, "ignoring unexpected broker frame");
                }
            }
        }
    }

    /// Handles the loss of the transport of `generation`.
    ///
    /// Moves to `Disconnected`, records `reason`, and schedules the next
    /// reconnect or reports that attempts are exhausted. The reconnect timer
    /// starts only after `Closed` and `ReconnectScheduled` are queued.
    async fn link_lost(self: &Arc<Self>, generation: u64, reason: Option<String>, by: LostBy) {
        let mut events = Vec::with_capacity(3);
        let mut retry = None;
        let reader = {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.shut_down {
                return;
            }
            shared.generation += 1;
            let link = shared.link.take();
            shared.state = ConnectionState::Disconnected;

            if let Some(reason) = &reason {
                shared.error = Some(reason.clone());
                events.push(ConnectionEvent::Error(reason.clone()));
            }
            events.push(ConnectionEvent::Closed);

            if shared.auto_reconnect {
                let max = self.config.reconnect.max_attempts;
                if shared.attempts < max {
                    shared.attempts += 1;
                    let attempt = shared.attempts;
                    let delay = self.config.reconnect.delay_for(attempt);
                    tracing::info!(
                        attempt,
                        max,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "scheduling broker reconnect"
                    );
                    retry = Some((shared.generation, attempt, delay));
                    events.push(ConnectionEvent::ReconnectScheduled { attempt, delay });
                } else {
                    tracing::warn!(attempts = shared.attempts, "giving up on broker reconnect");
                    events.push(ConnectionEvent::ReconnectExhausted);
                }
            }
            link.and_then(|link| link.reader)
        };

        tracing::info!(
            ?by,
            reason = reason.as_deref().unwrap_or("closed"),
            "broker connection lost"
        );
        if let Some(reader) = reader.filter(|_| by != LostBy::Reader) {
            reader.abort();
        }
        for event in events {
            self.emit(event).await;
        }

        let Some((generation, attempt, delay)) = retry else {
            return;
        };
        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.shut_down || !shared.auto_reconnect {
            tracing::debug!(attempt, "reconnect superseded before it was scheduled");
            return;
        }
        let timer = tokio::spawn(Arc::clone(self).reconnect_after(generation, attempt, delay));
        if let Some(old) = shared.reconnect_timer.replace(timer) {
            old.abort();
        }
    }

    /// Waits `delay`, then reconnects unless something else happened since
    /// the timer was set.
    fn reconnect_after(
        self: Arc<Self>,
        generation: u64,
        attempt: u32,
        delay: Duration,
    ) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            let auth = {
                let mut shared = self.shared.lock();
                if shared.generation != generation
                    || shared.shut_down
                    || !shared.auto_reconnect
                    || shared.state != ConnectionState::Disconnected
                {
                    return;
                }
                shared.reconnect_timer = None;
                let token = self.session.borrow().token().map(str::to_owned);
                if token.is_some() {
                    shared.state = ConnectionState::Connecting;
                    shared.generation += 1;
                }
                token.map(|token| (token, shared.generation))
            };
            let Some((token, generation)) = auth else {
                tracing::warn!(attempt, "reconnect skipped: no access token");
                let _ = self.fail(ConnectionError::AuthUnavailable);
                return;
            };
            tracing::info!(attempt, url = %self.config.url, "reconnecting to broker");
            let _ = self.establish(generation, &token).await;
        }
        .boxed()
    }

    fn disconnect(&self) {
        let (link, timer, was) = {
            let mut shared = self.shared.lock();
            shared.auto_reconnect = false;
            shared.attempts = 0;
            shared.generation += 1;
            let was = std::mem::take(&mut shared.state);
            (shared.link.take(), shared.reconnect_timer.take(), was)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(link) = link {
            // The writer flushes DISCONNECT, then closes the socket once the
            // sender is dropped.
            let _ = link.outbound.send(codec::disconnect_frame());
            if let Some(reader) = link.reader {
                reader.abort();
            }
        }
        if was != ConnectionState::Disconnected {
            tracing::info!(url = %self.config.url, "disconnected from broker");
            self.emit_now(ConnectionEvent::Closed);
        }
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Frame>> {
        let shared = self.shared.lock();
        if shared.state != ConnectionState::Connected {
            return None;
        }
        shared.link.as_ref().map(|link| link.outbound.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.lock().generation == generation
    }

    /// Records `err` in the error slot, reports it, and hands it back.
    fn fail(&self, err: ConnectionError) -> ConnectionError {
        let message = err.to_string();
        tracing::warn!(err = %message, "broker operation failed");
        self.shared.lock().error = Some(message.clone());
        self.emit_now(ConnectionEvent::Error(message));
        err
    }

    async fn emit(&self, event: ConnectionEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.events.send(event).await;
    }

    fn emit_now(&self, event: ConnectionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::warn!(?event, "connection event channel full, dropping event");
        }
    }
}
