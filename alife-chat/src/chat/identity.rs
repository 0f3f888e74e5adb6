//! Resolves which conversation an (item, user) pair belongs to.
//!
//! Lookups go through a [`ChatBackend`] and are cached per pair, including
//! the "no conversation yet" answer. Transient failures are retried with the
//! configured backoff; nothing else is.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use alife_chat_proto::message::{ChatId, ItemId, UserId};

use crate::backend::{BackendError, ChatBackend, with_retry};
use crate::config::ResolverConfig;

/// What to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityQuery {
    /// Item the conversation is about.
    pub item_id: ItemId,
    /// The signed-in user.
    pub user_id: UserId,
    /// A chat id the caller already knows; skips the lookup entirely.
    pub explicit_chat_id: Option<ChatId>,
    /// When `false`, no lookup is made.
    pub enabled: bool,
}

#[derive(Debug, Clone)]
struct CachedLookup {
    chat_id: Option<ChatId>,
    fetched_at: Instant,
}

/// Cached conversation lookup.
pub struct ConversationResolver<B: ChatBackend> {
    backend: Arc<B>,
    config: ResolverConfig,
    cache: Mutex<HashMap<(ItemId, UserId), CachedLookup>>,
}

impl<B: ChatBackend> ConversationResolver<B> {
    /// Creates a resolver over `backend`.
    #[must_use]
    pub fn new(backend: Arc<B>, config: ResolverConfig) -> Self {
        Self {
            backend,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the chat id for `query`.
    ///
    /// Returns `Ok(None)` when the query is disabled, no token is available,
    /// or the backend knows no conversation for the pair.
    ///
    /// # Errors
    ///
    /// Returns the last [`BackendError`] once retries are exhausted, or the
    /// first non-transient one.
    pub async fn resolve(
        &self,
        query: &IdentityQuery,
        token: Option<&str>,
    ) -> Result<Option<ChatId>, BackendError> {
        if let Some(explicit) = &query.explicit_chat_id {
            return Ok(Some(explicit.clone()));
        }
        let Some(token) = token.filter(|_| query.enabled) else {
            return Ok(None);
        };

        let key = (query.item_id.clone(), query.user_id.clone());
        if let Some(hit) = self.fresh(&key) {
            tracing::trace!(item = %key.0, user = %key.1, "conversation lookup served from cache");
            return Ok(hit);
        }

        let chat_id = with_retry(&self.config.retry, "resolve_conversation", move || {
            self.backend
                .resolve_conversation(&query.item_id, &query.user_id, token)
        })
        .await?;

        tracing::debug!(
            item = %key.0,
            user = %key.1,
            chat_id = ?chat_id,
            "resolved conversation"
        );
        self.cache.lock().insert(
            key,
            CachedLookup {
                chat_id: chat_id.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(chat_id)
    }

    /// Drops the cached answer for `(item, user)`.
    pub fn invalidate(&self, item: &ItemId, user: &UserId) {
        self.cache.lock().remove(&(item.clone(), user.clone()));
    }

    fn fresh(&self, key: &(ItemId, UserId)) -> Option<Option<ChatId>> {
        let cache = self.cache.lock();
        let entry = cache.get(key)?;
        (entry.fetched_at.elapsed() < self.config.stale_after).then(|| entry.chat_id.clone())
    }
}
