//! REST backend abstraction for conversation lookups and history.
//!
//! Defines the [`ChatBackend`] trait the identity resolver and history loader
//! talk to. Implementations:
//! - [`http::HttpBackend`]: the marketplace REST API over `reqwest`
//! - [`memory::InMemoryBackend`]: in-process store for tests and offline use

pub mod http;
pub mod memory;

use std::future::Future;

use alife_chat_proto::message::{ChatHistory, ChatId, ItemId, UserId};

use crate::config::RetryPolicy;

/// Errors returned by backend requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bearer token was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A failure that may succeed on retry (network error, 5xx).
    #[error("backend unavailable: {0}")]
    Transient(String),

    /// The backend answered with something we cannot use.
    #[error("invalid response: {0}")]
    Invalid(String),
}

impl BackendError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait for the REST endpoints used by the chat layer.
pub trait ChatBackend: Send + Sync + 'static {
    /// Looks up the conversation between `user` and the owner of `item`.
    ///
    /// Returns `Ok(None)` when no conversation exists yet.
    fn resolve_conversation(
        &self,
        item: &ItemId,
        user: &UserId,
        token: &str,
    ) -> impl Future<Output = Result<Option<ChatId>, BackendError>> + Send;

    /// Fetches the persisted messages and peer presence of a conversation.
    fn fetch_history(
        &self,
        chat_id: &ChatId,
        token: &str,
    ) -> impl Future<Output = Result<ChatHistory, BackendError>> + Send;

    /// Marks every message in the conversation as read by `user`.
    fn mark_as_read(
        &self,
        chat_id: &ChatId,
        user: &UserId,
        token: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Runs `request` until it succeeds, fails permanently, or the policy's
/// retries are used up. Only [`BackendError::Transient`] is retried.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut request: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut retry = 0;
    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < policy.retries => {
                retry += 1;
                let delay = policy.delay_for(retry);
                tracing::debug!(
                    operation,
                    retry,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    err = %e,
                    "backend request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
