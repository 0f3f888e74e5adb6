//! STOMP 1.2 frame model and text codec.
//!
//! Frames travel inside WebSocket text messages. A message that consists
//! only of end-of-line characters is a heart-beat.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Error type for frame encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The command line is not a known STOMP command.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP does not define.
    #[error("invalid escape sequence in header: {0:?}")]
    InvalidEscape(String),
    /// The frame ended before the blank line separating headers from body.
    #[error("frame truncated before end of headers")]
    Truncated,
    /// The body is not terminated by a NUL octet.
    #[error("frame body is not NUL-terminated")]
    MissingTerminator,
    /// The `content-length` header is unparsable or disagrees with the body.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    /// A `heart-beat` header is not of the form `cx,cy`.
    #[error("invalid heart-beat header: {0:?}")]
    InvalidHeartBeat(String),
}

/// STOMP frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client opens a session.
    Connect,
    /// Client opens a session (STOMP 1.2 spelling).
    Stomp,
    /// Server accepts a session.
    Connected,
    /// Client publishes to a destination.
    Send,
    /// Client subscribes to a destination.
    Subscribe,
    /// Client cancels a subscription.
    Unsubscribe,
    /// Client acknowledges a message.
    Ack,
    /// Client rejects a message.
    Nack,
    /// Client starts a transaction.
    Begin,
    /// Client commits a transaction.
    Commit,
    /// Client aborts a transaction.
    Abort,
    /// Client closes the session.
    Disconnect,
    /// Server delivers a message from a subscription.
    Message,
    /// Server confirms a receipt request.
    Receipt,
    /// Server reports a protocol error.
    Error,
}

impl Command {
    /// Returns the on-the-wire spelling of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED frames carry raw header values (no escaping),
    /// for compatibility with STOMP 1.0 peers.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

/// A single STOMP frame.
///
/// Headers keep their wire order; when a header repeats, the first
/// occurrence wins on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Frame body (UTF-8; JSON for chat traffic).
    pub body: String,
}

/// Result of decoding one WebSocket text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A bare end-of-line keep-alive.
    HeartBeat,
    /// A complete frame.
    Frame(Frame),
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Looks up a header value by name.
    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Encodes the frame into its text wire form.
    ///
    /// A `content-length` header is added for non-empty bodies unless the
    /// caller already set one.
    #[must_use]
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decodes one WebSocket text message.
    ///
    /// Leading end-of-line characters (heart-beats sent ahead of a frame) are
    /// skipped. Anything after the terminating NUL is ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing the first structural problem.
    pub fn decode(input: &str) -> Result<Incoming, FrameError> {
        let input = input.trim_start_matches(['\r', '\n']);
        if input.is_empty() {
            return Ok(Incoming::HeartBeat);
        }

        let (command_line, mut rest) = split_line(input).ok_or(FrameError::Truncated)?;
        let command: Command = command_line.parse()?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let (line, remaining) = split_line(rest).ok_or(FrameError::Truncated)?;
            rest = remaining;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let frame = Self {
            command,
            headers,
            body: String::new(),
        };

        let body = match frame.get_header("content-length") {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(raw.to_string()))?;
                let body = rest.get(..len).ok_or_else(|| {
                    FrameError::InvalidContentLength(format!(
                        "{len} exceeds remaining {} bytes",
                        rest.len()
                    ))
                })?;
                if rest.as_bytes().get(len) != Some(&0) {
                    return Err(FrameError::MissingTerminator);
                }
                body
            }
            None => {
                let end = rest.find('\0').ok_or(FrameError::MissingTerminator)?;
                &rest[..end]
            }
        };

        Ok(Incoming::Frame(frame.with_body(body)))
    }
}

/// Splits off the first line, accepting both `\n` and `\r\n` endings.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = &input[..idx];
    Some((line.strip_suffix('\r').unwrap_or(line), &input[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// A `heart-beat` header value: `outgoing,incoming` in milliseconds.
///
/// From the client's point of view `outgoing` is how often it can send and
/// `incoming` how often it wants to hear from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Smallest interval at which this side can send heart-beats (0 = never).
    pub outgoing_ms: u64,
    /// Desired interval between heart-beats from the peer (0 = none wanted).
    pub incoming_ms: u64,
}

impl HeartBeat {
    /// Creates a heart-beat setting.
    #[must_use]
    pub const fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parses a `cx,cy` header value.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidHeartBeat`] if the value is malformed.
    pub fn parse(value: &str) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidHeartBeat(value.to_string());
        let (out, inc) = value.split_once(',').ok_or_else(invalid)?;
        Ok(Self {
            outgoing_ms: out.trim().parse().map_err(|_| invalid())?,
            incoming_ms: inc.trim().parse().map_err(|_| invalid())?,
        })
    }

    /// Negotiates the effective intervals between this (client) setting and
    /// the server's `CONNECTED` header.
    #[must_use]
    pub fn negotiate(self, server: Self) -> NegotiatedHeartBeat {
        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        NegotiatedHeartBeat {
            send_every: pick(self.outgoing_ms, server.incoming_ms),
            expect_every: pick(self.incoming_ms, server.outgoing_ms),
        }
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

/// Effective heart-beat intervals after negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatedHeartBeat {
    /// How often the client must send a heart-beat, if at all.
    pub send_every: Option<Duration>,
    /// How often the server promised to send something, if at all.
    pub expect_every: Option<Duration>,
}
