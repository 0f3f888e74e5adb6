//! Loads persisted conversation history and peer presence.
//!
//! A [`HistoryLoader`] fetches [`ChatHistory`] snapshots through a
//! [`ChatBackend`], caching each conversation for a short window. Nothing is
//! fetched until both an access token and a chat id are available.
//! Mark-as-read runs as a detached task whose failures are only logged.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use alife_chat_proto::message::{ChatHistory, ChatId, UserId};

use crate::backend::{BackendError, ChatBackend, with_retry};
use crate::config::HistoryConfig;

#[derive(Debug, Clone)]
struct CachedHistory {
    history: ChatHistory,
    fetched_at: Instant,
}

/// Cached history fetcher.
pub struct HistoryLoader<B: ChatBackend> {
    backend: Arc<B>,
    config: HistoryConfig,
    cache: Mutex<HashMap<ChatId, CachedHistory>>,
}

impl<B: ChatBackend> HistoryLoader<B> {
    /// Creates a loader over `backend`.
    #[must_use]
    pub fn new(backend: Arc<B>, config: HistoryConfig) -> Self {
        Self {
            backend,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the history of `chat_id`, from cache while it is fresh.
    ///
    /// Returns `Ok(None)` while the chat id or the token is missing.
    ///
    /// # Errors
    ///
    /// Returns the [`BackendError`] of the final failed attempt.
    pub async fn load(
        &self,
        chat_id: Option<&ChatId>,
        token: Option<&str>,
    ) -> Result<Option<ChatHistory>, BackendError> {
        let (Some(chat_id), Some(token)) = (chat_id, token) else {
            return Ok(None);
        };
        if let Some(hit) = self.fresh(chat_id) {
            return Ok(Some(hit));
        }
        self.fetch(chat_id, token).await.map(Some)
    }

    /// Like [`load`](Self::load), but always asks the backend.
    ///
    /// # Errors
    ///
    /// Returns the [`BackendError`] of the final failed attempt.
    pub async fn reload(
        &self,
        chat_id: Option<&ChatId>,
        token: Option<&str>,
    ) -> Result<Option<ChatHistory>, BackendError> {
        let (Some(chat_id), Some(token)) = (chat_id, token) else {
            return Ok(None);
        };
        self.fetch(chat_id, token).await.map(Some)
    }

    /// Marks `chat_id` as read by `user` in the background.
    ///
    /// Failures are logged and otherwise ignored. The returned handle may be
    /// dropped.
    pub fn mark_as_read(&self, chat_id: ChatId, user: UserId, token: String) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            match backend.mark_as_read(&chat_id, &user, &token).await {
                Ok(()) => tracing::debug!(chat_id = %chat_id, user = %user, "marked as read"),
                Err(e) => tracing::warn!(
                    chat_id = %chat_id,
                    user = %user,
                    err = %e,
                    "failed to mark conversation as read"
                ),
            }
        })
    }

    /// Drops the cached history of `chat_id`.
    pub fn invalidate(&self, chat_id: &ChatId) {
        self.cache.lock().remove(chat_id);
    }

    /// Drops every cached history.
    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }

    async fn fetch(&self, chat_id: &ChatId, token: &str) -> Result<ChatHistory, BackendError> {
        let history = with_retry(&self.config.retry, "fetch_history", move || {
            self.backend.fetch_history(chat_id, token)
        })
        .await?;

        tracing::debug!(
            chat_id = %chat_id,
            messages = history.messages.len(),
            peer_online = history.peer_online,
            "loaded chat history"
        );
        self.cache.lock().insert(
            chat_id.clone(),
            CachedHistory {
                history: history.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(history)
    }

    fn fresh(&self, chat_id: &ChatId) -> Option<ChatHistory> {
        let cache = self.cache.lock();
        let entry = cache.get(chat_id)?;
        (entry.fetched_at.elapsed() < self.config.stale_after).then(|| entry.history.clone())
    }
}
