//! Authenticated session consumed from the auth provider.
//!
//! The chat layer never creates or refreshes credentials. It reads a
//! [`Session`] published through a [`tokio::sync::watch`] channel and reacts
//! when the token appears or disappears.

use alife_chat_proto::message::UserId;
use tokio::sync::watch;

/// Snapshot of the current authentication state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Bearer token for the broker and REST backend.
    pub access_token: Option<String>,
    /// The signed-in user.
    pub user_id: Option<UserId>,
    /// Whether the auth provider is still resolving the session.
    pub is_loading: bool,
}

impl Session {
    /// A resolved session for `user_id` holding `access_token`.
    #[must_use]
    pub fn authenticated(access_token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            user_id: Some(user_id.into()),
            is_loading: false,
        }
    }

    /// A session that is still being resolved.
    #[must_use]
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }

    /// The bearer token, unless the session is still loading.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        if self.is_loading {
            return None;
        }
        self.access_token.as_deref()
    }
}

/// Creates a session channel seeded with `initial`.
///
/// The sender side belongs to whatever owns authentication; the receiver is
/// handed to the chat layer.
#[must_use]
pub fn channel(initial: Session) -> (watch::Sender<Session>, watch::Receiver<Session>) {
    watch::channel(initial)
}
