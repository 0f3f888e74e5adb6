//! [`ChatBackend`] over the marketplace REST API.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET chats/item/{item}/user/{user}` → `{ "chatId": ... }`, 404 when none
//! - `GET chats/{chat}/messages` → `{ "messages": [...], "peerOnline": bool }`
//! - `POST chats/{chat}/read?userId={user}`

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use url::Url;

use alife_chat_proto::message::{ChatHistory, ChatId, ItemId, UserId};

use super::{BackendError, ChatBackend};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Body of the conversation lookup endpoint.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatIdResponse {
    #[serde(default)]
    chat_id: Option<ChatId>,
}

/// REST client for the chat endpoints.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: Url,
    client: Client,
}

impl HttpBackend {
    /// Creates a client rooted at `base_url` (e.g. `https://host/api`).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Invalid`] if the URL cannot be used as a base,
    /// or if the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BackendError::Invalid(format!("bad api url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Invalid(format!(
                "api url {base_url} cannot be a base"
            )));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Invalid(format!("http client: {e}")))?;
        Ok(Self { base_url, client })
    }

    /// The base URL requests are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(request: RequestBuilder, token: &str) -> Result<Response, BackendError> {
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))
    }
}

/// Maps an HTTP status to a [`BackendError`], or `None` for success.
fn status_error(status: StatusCode, what: &str) -> Option<BackendError> {
    if status.is_success() {
        None
    } else if status == StatusCode::NOT_FOUND {
        Some(BackendError::NotFound(what.to_string()))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Some(BackendError::Unauthorized(format!("{what}: {status}")))
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(BackendError::Transient(format!("{what}: {status}")))
    } else {
        Some(BackendError::Invalid(format!("{what}: {status}")))
    }
}

impl ChatBackend for HttpBackend {
    async fn resolve_conversation(
        &self,
        item: &ItemId,
        user: &UserId,
        token: &str,
    ) -> Result<Option<ChatId>, BackendError> {
        let url = self.api_url(&["chats", "item", item.as_str(), "user", user.as_str()]);
        let response = Self::send(self.client.get(url), token).await?;
        match status_error(response.status(), "conversation lookup") {
            None => {}
            Some(BackendError::NotFound(_)) => return Ok(None),
            Some(e) => return Err(e),
        }
        let body: ChatIdResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Invalid(e.to_string()))?;
        Ok(body.chat_id)
    }

    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        token: &str,
    ) -> Result<ChatHistory, BackendError> {
        let url = self.api_url(&["chats", chat_id.as_str(), "messages"]);
        let response = Self::send(self.client.get(url), token).await?;
        if let Some(e) = status_error(response.status(), "chat history") {
            return Err(e);
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Invalid(e.to_string()))
    }

    async fn mark_as_read(
        &self,
        chat_id: &ChatId,
        user: &UserId,
        token: &str,
    ) -> Result<(), BackendError> {
        let mut url = self.api_url(&["chats", chat_id.as_str(), "read"]);
        url.query_pairs_mut().append_pair("userId", user.as_str());
        let response = Self::send(self.client.post(url), token).await?;
        status_error(response.status(), "mark as read").map_or(Ok(()), Err)
    }
}
