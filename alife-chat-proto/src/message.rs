//! Wire format message types for Additional Life private chat.
//!
//! These are the JSON shapes exchanged with the messaging broker and the
//! REST backend. Field names follow the broker's camelCase convention.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Globally unique message identifier.
    ///
    /// Client-generated (UUID v7) for outgoing messages, server-assigned or
    /// echoed for persisted ones.
    MessageId
);

string_id!(
    /// Identifies a 1:1 conversation scoped to one item.
    ChatId
);

string_id!(
    /// Identifies a marketplace item.
    ItemId
);

string_id!(
    /// Identifies a marketplace user.
    UserId
);

impl MessageId {
    /// Generates a fresh time-ordered message identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Millisecond-precision UTC timestamp.
///
/// Accepts RFC 3339 strings, zone-less ISO-8601 datetimes (interpreted as
/// UTC) and epoch milliseconds on input. Always serializes as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(millis)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
        )
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the underlying `chrono` datetime.
    #[must_use]
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    fn parse(text: &str) -> Option<Self> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self(dt.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Self(naive.and_utc()))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(millis) => Ok(Self::from_millis(millis)),
            Raw::Text(text) => Self::parse(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("unrecognised timestamp: {text}"))
            }),
        }
    }
}

/// Kind of chat event carried by a [`ChatMessage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Ordinary chat text.
    #[default]
    Chat,
    /// A participant joined the conversation.
    Join,
    /// A participant left the conversation.
    Leave,
}

/// A chat message as persisted by the backend and delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// Conversation this message belongs to, once the broker assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    /// Item the conversation is about.
    pub item_id: ItemId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Display name of the author, when the broker provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// The other participant.
    pub recipient_id: UserId,
    /// Message text.
    pub content: String,
    /// Kind of event.
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// When the message was created.
    pub timestamp: Timestamp,
}

impl ChatMessage {
    /// Returns `true` if this message was exchanged between `a` and `b`, in
    /// either direction.
    #[must_use]
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (self.sender_id == *a && self.recipient_id == *b)
            || (self.sender_id == *b && self.recipient_id == *a)
    }
}

/// Error returned when outgoing content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates outgoing message content.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank content, or
/// [`ValidationError::TooLarge`] if it exceeds [`MAX_CONTENT_SIZE`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let size = content.len();
    if size > MAX_CONTENT_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_CONTENT_SIZE,
        });
    }
    Ok(())
}

/// A message on an already-known conversation, before it is stamped for
/// publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Caller-chosen id; a fresh one is generated when absent.
    pub id: Option<MessageId>,
    /// Target conversation.
    pub chat_id: ChatId,
    /// Item the conversation is about.
    pub item_id: ItemId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Display name of the author.
    pub sender_name: Option<String>,
    /// The other participant.
    pub recipient_id: UserId,
    /// Message text.
    pub content: String,
    /// Kind of event.
    pub message_type: MessageType,
}

impl OutgoingMessage {
    /// Stamps the message with an id (unless one was chosen) and the given
    /// timestamp, producing the payload published to the broker.
    #[must_use]
    pub fn stamp(self, timestamp: Timestamp) -> ChatMessage {
        ChatMessage {
            id: self.id.unwrap_or_else(MessageId::generate),
            chat_id: Some(self.chat_id),
            item_id: self.item_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            recipient_id: self.recipient_id,
            content: self.content,
            message_type: self.message_type,
            timestamp,
        }
    }
}

/// Payload asking the broker to allocate a new conversation.
///
/// Carries no chat id: the broker assigns one and echoes the first message
/// back with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversation {
    /// Item the conversation is about.
    pub item_id: ItemId,
    /// Participant opening the conversation.
    pub sender_id: UserId,
    /// The other participant.
    pub recipient_id: UserId,
    /// Text of the first message.
    pub content: String,
}

/// Durable conversation state returned by the history endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    /// Persisted messages, oldest first.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Last known presence of the counterpart.
    #[serde(default)]
    pub peer_online: bool,
}
