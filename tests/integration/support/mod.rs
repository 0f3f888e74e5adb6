//! Shared fixtures for the integration tests.
//!
//! [`MockBroker`] speaks just enough STOMP over a real WebSocket to stand in
//! for the marketplace broker:
//! - answers CONNECT with CONNECTED (or ERROR for a wrong token)
//! - tracks SUBSCRIBE/UNSUBSCRIBE per connection
//! - echoes `/app/chat.sendMessage` to `/topic/chat.{chatId}`
//! - turns `/app/chat.startConversation` into a message on `/topic/public`
//!   carrying a freshly allocated chat id
//!
//! Accepted messages are optionally recorded into an [`InMemoryBackend`], so
//! history and identity lookups see what went over the wire.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use alife_chat::backend::memory::InMemoryBackend;
use alife_chat::config::{ConnectionConfig, ReconnectConfig};
use alife_chat::connection::ConnectionEvent;
use alife_chat_proto::destination::Destinations;
use alife_chat_proto::frame::{Command, Frame, HeartBeat, Incoming};
use alife_chat_proto::message::{
    ChatId, ChatMessage, ItemId, MessageId, MessageType, StartConversation, Timestamp, UserId,
};

/// Default time to wait for anything asynchronous to happen.
pub const WAIT: Duration = Duration::from_secs(5);

/// Adjustable broker behaviour.
#[derive(Debug, Clone, Default)]
pub struct BrokerOptions {
    /// `heart-beat` header sent in CONNECTED.
    pub heart_beat: HeartBeat,
    /// Never send heart-beats, whatever was promised.
    pub silent: bool,
    /// Only this bearer token is accepted, when set.
    pub token: Option<String>,
}

struct Connection {
    outbox: mpsc::UnboundedSender<Message>,
    subscriptions: HashMap<String, String>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerState {
    options: Mutex<BrokerOptions>,
    connections: Mutex<HashMap<usize, Connection>>,
    received: Mutex<Vec<Frame>>,
    conversations: Mutex<HashMap<(ItemId, UserId, UserId), ChatId>>,
    backend: Option<Arc<InMemoryBackend>>,
    next_connection: AtomicUsize,
    next_chat: AtomicUsize,
    next_message: AtomicUsize,
    connects: AtomicUsize,
    heart_beats: AtomicUsize,
}

/// An in-process STOMP broker on a random local port.
pub struct MockBroker {
    /// Bound address.
    pub addr: SocketAddr,
    state: Arc<BrokerState>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl MockBroker {
    /// Starts a broker with default options.
    pub async fn start() -> Self {
        Self::with_state(BrokerState::default()).await
    }

    /// Starts a broker with `options`.
    pub async fn with_options(options: BrokerOptions) -> Self {
        let state = BrokerState {
            options: Mutex::new(options),
            ..BrokerState::default()
        };
        Self::with_state(state).await
    }

    /// Starts a broker that records every chat message into `backend`.
    pub async fn with_backend(backend: Arc<InMemoryBackend>) -> Self {
        let state = BrokerState {
            backend: Some(backend),
            ..BrokerState::default()
        };
        Self::with_state(state).await
    }

    async fn with_state(state: BrokerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(state);
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Self {
            addr,
            state,
            accept: Mutex::new(Some(accept)),
        }
    }

    /// WebSocket URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connection settings for this broker with a fast reconnect policy.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(self.url());
        config.connect_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectConfig {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
        };
        config
    }

    /// Changes behaviour for connections accepted from now on.
    pub fn set_options(&self, options: BrokerOptions) {
        *self.state.options.lock() = options;
    }

    /// Severs every open connection without a STOMP goodbye.
    pub fn drop_connections(&self) {
        let connections: Vec<Connection> = self
            .state
            .connections
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            if let Some(task) = connection.task {
                task.abort();
            }
        }
    }

    /// Stops listening and severs every connection.
    pub fn stop(&self) {
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        self.drop_connections();
    }

    /// Listens again on the same address after [`stop`](Self::stop).
    pub async fn restart(&self) {
        let listener = TcpListener::bind(self.addr)
            .await
            .expect("rebind mock broker");
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&self.state)));
        if let Some(old) = self.accept.lock().replace(accept) {
            old.abort();
        }
    }

    /// Number of CONNECT frames accepted so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of client heart-beats received so far.
    pub fn heart_beats(&self) -> usize {
        self.state.heart_beats.load(Ordering::SeqCst)
    }

    /// Every frame received from clients, heart-beats excluded.
    pub fn received(&self) -> Vec<Frame> {
        self.state.received.lock().clone()
    }

    /// Frames received with `command`.
    pub fn received_of(&self, command: Command) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|f| f.command == command)
            .collect()
    }

    /// Number of live subscriptions to `destination`, across connections.
    pub fn subscribers(&self, destination: &str) -> usize {
        self.state
            .connections
            .lock()
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| d.as_str() == destination)
            .count()
    }

    /// Waits until `destination` has at least `count` subscribers.
    pub async fn wait_for_subscribers(&self, destination: &str, count: usize) {
        wait_until(|| self.subscribers(destination) >= count).await;
    }

    /// Delivers `msg` to every subscriber of `destination`.
    pub fn publish(&self, destination: &str, msg: &ChatMessage) {
        self.state.deliver(destination, msg);
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BrokerState>) {
    while let Ok((stream, _)) = listener.accept().await {
        let id = state.next_connection.fetch_add(1, Ordering::SeqCst);
        let (outbox, rx) = mpsc::unbounded_channel();
        state.connections.lock().insert(
            id,
            Connection {
                outbox,
                subscriptions: HashMap::new(),
                task: None,
            },
        );
        let task = tokio::spawn(serve(Arc::clone(&state), id, stream, rx));
        if let Some(connection) = state.connections.lock().get_mut(&id) {
            connection.task = Some(task);
        }
    }
}

async fn serve(
    state: Arc<BrokerState>,
    id: usize,
    stream: TcpStream,
    mut outbox: mpsc::UnboundedReceiver<Message>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        state.connections.lock().remove(&id);
        return;
    };
    let mut heart_beat: Option<tokio::time::Interval> = None;

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let Some(Ok(msg)) = incoming else { break };
                let text = match msg {
                    Message::Text(text) => text.as_str().to_string(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frame = match Frame::decode(&text) {
                    Ok(Incoming::Frame(frame)) => frame,
                    Ok(Incoming::HeartBeat) => {
                        state.heart_beats.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    Err(_) => continue,
                };
                state.received.lock().push(frame.clone());
                match frame.command {
                    Command::Connect | Command::Stomp => {
                        match state.handshake(&frame) {
                            Ok((reply, every)) => {
                                if ws.send(Message::text(reply.encode())).await.is_err() {
                                    break;
                                }
                                heart_beat = every.map(|every| {
                                    tokio::time::interval_at(
                                        tokio::time::Instant::now() + every,
                                        every,
                                    )
                                });
                            }
                            Err(reply) => {
                                let _ = ws.send(Message::text(reply.encode())).await;
                                let _ = ws.close(None).await;
                                break;
                            }
                        }
                    }
                    Command::Disconnect => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    _ => state.handle(id, &frame),
                }
            }
            Some(out) = outbox.recv() => {
                if ws.send(out).await.is_err() {
                    break;
                }
            }
            () = tick(heart_beat.as_mut()) => {
                if ws.send(Message::text("\n")).await.is_err() {
                    break;
                }
            }
        }
    }
    state.connections.lock().remove(&id);
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl BrokerState {
    /// Answers a CONNECT frame: CONNECTED plus the heart-beat interval to
    /// keep, or the ERROR frame to send before closing.
    fn handshake(&self, frame: &Frame) -> Result<(Frame, Option<Duration>), Frame> {
        let options = self.options.lock().clone();
        if let Some(token) = &options.token {
            let expected = format!("Bearer {token}");
            if frame.get_header("Authorization") != Some(expected.as_str()) {
                return Err(Frame::new(Command::Error)
                    .header("message", "Unauthorized")
                    .with_body("invalid access token"));
            }
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let reply = Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", options.heart_beat.to_string());
        let every = (!options.silent && options.heart_beat.outgoing_ms > 0)
            .then(|| Duration::from_millis(options.heart_beat.outgoing_ms));
        Ok((reply, every))
    }

    fn handle(&self, id: usize, frame: &Frame) {
        match frame.command {
            Command::Subscribe => {
                let (Some(sub), Some(destination)) =
                    (frame.get_header("id"), frame.get_header("destination"))
                else {
                    return;
                };
                if let Some(connection) = self.connections.lock().get_mut(&id) {
                    connection
                        .subscriptions
                        .insert(sub.to_string(), destination.to_string());
                }
            }
            Command::Unsubscribe => {
                let Some(sub) = frame.get_header("id") else {
                    return;
                };
                if let Some(connection) = self.connections.lock().get_mut(&id) {
                    connection.subscriptions.remove(sub);
                }
            }
            Command::Send => self.route(frame),
            _ => {}
        }
    }

    fn route(&self, frame: &Frame) {
        let destinations = Destinations::default();
        match frame.get_header("destination") {
            Some(d) if d == destinations.send => {
                let Ok(msg) = serde_json::from_str::<ChatMessage>(&frame.body) else {
                    return;
                };
                let Some(chat_id) = msg.chat_id.clone() else {
                    return;
                };
                self.record(&msg);
                self.deliver(&destinations.conversation_topic(&chat_id), &msg);
            }
            Some(d) if d == destinations.start_conversation => {
                let Ok(start) = serde_json::from_str::<StartConversation>(&frame.body) else {
                    return;
                };
                let msg = ChatMessage {
                    id: MessageId::generate(),
                    chat_id: Some(self.conversation_for(&start)),
                    item_id: start.item_id,
                    sender_id: start.sender_id,
                    sender_name: None,
                    recipient_id: start.recipient_id,
                    content: start.content,
                    message_type: MessageType::Chat,
                    timestamp: Timestamp::now(),
                };
                self.record(&msg);
                self.deliver(&destinations.broadcast, &msg);
            }
            _ => {}
        }
    }

    /// Chat id for the pair in `start`, allocating `c1`, `c2`, ... on first
    /// use.
    fn conversation_for(&self, start: &StartConversation) -> ChatId {
        let (a, b) = if start.sender_id <= start.recipient_id {
            (start.sender_id.clone(), start.recipient_id.clone())
        } else {
            (start.recipient_id.clone(), start.sender_id.clone())
        };
        self.conversations
            .lock()
            .entry((start.item_id.clone(), a, b))
            .or_insert_with(|| {
                let n = self.next_chat.fetch_add(1, Ordering::SeqCst) + 1;
                ChatId::new(format!("c{n}"))
            })
            .clone()
    }

    fn record(&self, msg: &ChatMessage) {
        if let Some(backend) = &self.backend {
            backend.record_message(msg);
        }
    }

    fn deliver(&self, destination: &str, msg: &ChatMessage) {
        let body = serde_json::to_string(msg).unwrap();
        let connections = self.connections.lock();
        for connection in connections.values() {
            for (sub, d) in &connection.subscriptions {
                if d != destination {
                    continue;
                }
                let n = self.next_message.fetch_add(1, Ordering::SeqCst);
                let frame = Frame::new(Command::Message)
                    .header("destination", destination)
                    .header("subscription", sub.as_str())
                    .header("message-id", format!("m-{n}"))
                    .header("content-type", "application/json")
                    .with_body(body.clone());
                let _ = connection.outbox.send(Message::text(frame.encode()));
            }
        }
    }
}

/// A chat message between `from` and `to` about `item`.
pub fn chat_message(
    id: &str,
    chat_id: Option<&str>,
    item: &str,
    from: &str,
    to: &str,
    content: &str,
) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        chat_id: chat_id.map(ChatId::from),
        item_id: ItemId::from(item),
        sender_id: UserId::from(from),
        sender_name: None,
        recipient_id: UserId::from(to),
        content: content.to_string(),
        message_type: MessageType::Chat,
        // Millisecond precision, like everything that went over the wire.
        timestamp: Timestamp::from_millis(Timestamp::now().as_millis()),
    }
}

/// Polls `condition` every 10 ms until it holds, panicking after [`WAIT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receives connection events until one matches `pred`, returning it.
///
/// Events that do not match are skipped. Panics after [`WAIT`].
pub async fn wait_for_event(
    rx: &mut mpsc::Receiver<ConnectionEvent>,
    mut pred: impl FnMut(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for connection event")
}
