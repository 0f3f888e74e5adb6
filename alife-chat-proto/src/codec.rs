//! Builders for the client frames used by the chat layer, and JSON body
//! encoding/decoding for chat payloads.

use serde::Serialize;

use crate::frame::{Command, Frame, HeartBeat};
use crate::message::ChatMessage;

/// Error type for chat payload encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is not of the expected command.
    #[error("expected {expected} frame, got {actual}")]
    UnexpectedCommand {
        /// Command the caller wanted.
        expected: Command,
        /// Command that arrived.
        actual: Command,
    },
    /// A header value would break the frame apart.
    #[error("{name} header contains a line break or NUL")]
    UnsafeHeader {
        /// Header that was rejected.
        name: &'static str,
    },
}

/// Accepted STOMP protocol versions, advertised on CONNECT.
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Builds the `CONNECT` frame, carrying the bearer token for the broker's
/// authentication interceptor.
///
/// `CONNECT` headers are sent unescaped, so values must stay on one line.
///
/// # Errors
///
/// Returns [`CodecError::UnsafeHeader`] if `host` or `access_token` contains
/// CR, LF or NUL.
pub fn connect_frame(
    host: &str,
    access_token: &str,
    heart_beat: HeartBeat,
) -> Result<Frame, CodecError> {
    ensure_single_line("host", host)?;
    ensure_single_line("Authorization", access_token)?;
    Ok(Frame::new(Command::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header("heart-beat", heart_beat.to_string())
        .header("Authorization", format!("Bearer {access_token}")))
}

fn ensure_single_line(name: &'static str, value: &str) -> Result<(), CodecError> {
    if value.contains(['\r', '\n', '\0']) {
        return Err(CodecError::UnsafeHeader { name });
    }
    Ok(())
}

/// Builds a `SUBSCRIBE` frame with automatic acknowledgment.
#[must_use]
pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

/// Builds an `UNSUBSCRIBE` frame for a subscription id.
#[must_use]
pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).header("id", id)
}

/// Builds a `SEND` frame with a JSON body.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the payload cannot be serialized.
pub fn send_frame<T: Serialize>(destination: &str, payload: &T) -> Result<Frame, CodecError> {
    let body = serde_json::to_string(payload)?;
    Ok(Frame::new(Command::Send)
        .header("destination", destination)
        .header("content-type", "application/json")
        .with_body(body))
}

/// Builds a `DISCONNECT` frame.
#[must_use]
pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}

/// Decodes the chat message carried by a `MESSAGE` frame.
///
/// # Errors
///
/// Returns [`CodecError::UnexpectedCommand`] for other frames, or
/// [`CodecError::Json`] if the body is not a chat message.
pub fn decode_message(frame: &Frame) -> Result<ChatMessage, CodecError> {
    if frame.command != Command::Message {
        return Err(CodecError::UnexpectedCommand {
            expected: Command::Message,
            actual: frame.command,
        });
    }
    Ok(serde_json::from_str(&frame.body)?)
}

/// Describes an `ERROR` frame as one human-readable string.
#[must_use]
pub fn describe_error(frame: &Frame) -> String {
    let summary = frame.get_header("message").unwrap_or("broker error");
    let detail = frame.body.trim_end_matches(['\0', '\n']).trim();
    if detail.is_empty() {
        summary.to_string()
    } else {
        format!("{summary}: {detail}")
    }
}
