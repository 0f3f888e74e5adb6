//! STOMP session over a WebSocket.
//!
//! [`open`] performs the WebSocket upgrade and the CONNECT/CONNECTED
//! handshake. The resulting [`Link`] is split between a writer task, which
//! owns the sink and sends heart-beats, and a reader task, which owns the
//! stream and watches for heart-beat loss.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use alife_chat_proto::codec;
use alife_chat_proto::frame::{Command, Frame, HeartBeat, Incoming, NegotiatedHeartBeat};

use super::ConnectionError;
use crate::config::ConnectionConfig;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of the broker WebSocket.
pub(crate) type WsSink = SplitSink<WsStream, Message>;

/// Read half of the broker WebSocket.
pub(crate) type WsReader = SplitStream<WsStream>;

/// A freshly handshaken broker session.
pub(crate) struct Link {
    pub(crate) sink: WsSink,
    pub(crate) reader: WsReader,
    pub(crate) heart_beat: NegotiatedHeartBeat,
}

/// Something the reader observed on the socket.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A server frame other than a heart-beat.
    Frame(Frame),
    /// The connection is gone.
    Lost(Option<String>),
}

/// What ended a writer task.
#[derive(Debug)]
pub(crate) enum WriterExit {
    /// The outbound channel closed; the socket was closed politely.
    Closed,
    /// Writing failed.
    Failed(String),
}

/// Opens the WebSocket to `config.url` and completes the STOMP handshake,
/// all within `config.connect_timeout`.
///
/// # Errors
///
/// - [`ConnectionError::Timeout`] if the handshake does not finish in time.
/// - [`ConnectionError::Transport`] for URL, socket or WebSocket failures.
/// - [`ConnectionError::Protocol`] if the broker answers with `ERROR` or an
///   unexpected frame.
/// - [`ConnectionError::Codec`] if the token cannot be carried on `CONNECT`.
pub(crate) async fn open(config: &ConnectionConfig, token: &str) -> Result<Link, ConnectionError> {
    tokio::time::timeout(config.connect_timeout, handshake(config, token))
        .await
        .map_err(|_| {
            tracing::warn!(url = %config.url, "broker handshake timed out");
            ConnectionError::Timeout
        })?
}

async fn handshake(config: &ConnectionConfig, token: &str) -> Result<Link, ConnectionError> {
    let url = url::Url::parse(&config.url)
        .map_err(|e| ConnectionError::Transport(format!("invalid broker url {}: {e}", config.url)))?;
    let host = url.host_str().unwrap_or("localhost").to_string();
    let connect = codec::connect_frame(&host, token, config.heart_beat)?;

    let (ws_stream, _response) = connect_async(config.url.as_str()).await.map_err(|e| {
        tracing::warn!(url = %config.url, err = %e, "broker WebSocket connect failed");
        map_ws_connect_error(e)
    })?;
    let (mut sink, mut reader) = ws_stream.split();

    sink.send(Message::text(connect.encode()))
        .await
        .map_err(|e| ConnectionError::Transport(format!("failed to send CONNECT: {e}")))?;

    loop {
        let msg = reader.next().await.ok_or_else(|| {
            ConnectionError::Transport("broker closed the connection during handshake".into())
        })?;
        let msg = msg.map_err(|e| {
            ConnectionError::Transport(format!("WebSocket error during handshake: {e}"))
        })?;
        let Some(text) = message_text(&msg) else {
            if let Message::Close(_) = msg {
                return Err(ConnectionError::Transport(
                    "broker closed the connection during handshake".into(),
                ));
            }
            continue;
        };
        let frame = match Frame::decode(&text) {
            Ok(Incoming::HeartBeat) => continue,
            Ok(Incoming::Frame(frame)) => frame,
            Err(e) => {
                return Err(ConnectionError::Protocol(format!(
                    "malformed handshake frame: {e}"
                )));
            }
        };
        match frame.command {
            Command::Connected => {
                let server = frame
                    .get_header("heart-beat")
                    .map(HeartBeat::parse)
                    .transpose()
                    .map_err(|e| ConnectionError::Protocol(e.to_string()))?
                    .unwrap_or_default();
                let heart_beat = config.heart_beat.negotiate(server);
                tracing::info!(
                    url = %config.url,
                    version = frame.get_header("version").unwrap_or("1.0"),
                    ?heart_beat,
                    "connected to broker"
                );
                return Ok(Link {
                    sink,
                    reader,
                    heart_beat,
                });
            }
            Command::Error => {
                let reason = codec::describe_error(&frame);
                tracing::warn!(reason = %reason, "broker rejected CONNECT");
                return Err(ConnectionError::Protocol(reason));
            }
            other => {
                return Err(ConnectionError::Protocol(format!(
                    "expected CONNECTED, got {other}"
                )));
            }
        }
    }
}

/// Extracts the STOMP text carried by a WebSocket message.
///
/// Brokers may use text or binary frames; control frames carry none.
fn message_text(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.as_str().to_string()),
        Message::Binary(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

/// Background task that drains the outbound channel onto the socket.
///
/// Sends an EOL heart-beat whenever `send_every` elapses without other
/// traffic. When the channel closes, any queued frames are flushed and the
/// socket is closed.
pub(crate) async fn writer_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    send_every: Option<Duration>,
) -> WriterExit {
    let mut ticker = send_every.map(|every| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let next = tokio::select! {
            frame = outbound.recv() => frame.map(|f| Message::text(f.encode())),
            () = tick(ticker.as_mut()) => Some(Message::text("\n")),
        };
        let Some(msg) = next else {
            // Best effort: the broker may already be gone.
            let _ = sink.close().await;
            return WriterExit::Closed;
        };
        if let Err(e) = sink.send(msg).await {
            tracing::warn!(err = %e, "broker write failed");
            return WriterExit::Failed(e.to_string());
        }
        if let Some(interval) = ticker.as_mut() {
            interval.reset();
        }
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Reads the next server frame, skipping heart-beats and control frames.
///
/// Gives up with [`Inbound::Lost`] when nothing at all arrives within twice
/// `expect_every`.
pub(crate) async fn next_inbound(reader: &mut WsReader, expect_every: Option<Duration>) -> Inbound {
    let deadline = expect_every.map(|every| every.saturating_mul(2));
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, reader.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        "no heart-beat from broker"
                    );
                    return Inbound::Lost(Some("broker heart-beat timed out".into()));
                }
            },
            None => reader.next().await,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::warn!(err = %e, "broker WebSocket read error");
                return Inbound::Lost(Some(format!("connection error: {e}")));
            }
            None => {
                tracing::info!("broker WebSocket stream ended");
                return Inbound::Lost(None);
            }
        };
        if let Message::Close(close) = &msg {
            tracing::info!(?close, "broker WebSocket closed");
            return Inbound::Lost(None);
        }
        let Some(text) = message_text(&msg) else {
            continue;
        };
        match Frame::decode(&text) {
            Ok(Incoming::HeartBeat) => {}
            Ok(Incoming::Frame(frame)) => return Inbound::Frame(frame),
            Err(e) => {
                tracing::warn!(err = %e, "malformed broker frame, skipping");
            }
        }
    }
}

/// Map a `tokio_tungstenite` connection error to a [`ConnectionError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => ConnectionError::Transport(format!("broker unreachable: {io_err}")),
        WsError::Tls(_) => ConnectionError::Transport(format!("TLS error: {err}")),
        WsError::Http(response) => ConnectionError::Transport(format!(
            "broker HTTP error: status {}",
            response.status()
        )),
        other => ConnectionError::Transport(format!("broker connection error: {other}")),
    }
}
