// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end tests for the private chat facade.
//!
//! A buyer (`u1`) and a seller (`u2`) talk about item `i1` through a
//! [`MockBroker`] that persists every message into a shared
//! [`InMemoryBackend`]. These tests validate:
//! - the first message starts a conversation and both sides adopt its id
//! - replies travel over the conversation topic
//! - a participant opening later resolves the id and loads history
//! - traffic of other conversations never reaches the timeline
//! - switching conversation drops the previous one
//! - mark-as-read and history reloads go to the backend

mod support;

use std::sync::Arc;
use std::time::Duration;

use alife_chat::backend::BackendError;
use alife_chat::backend::memory::{Endpoint, InMemoryBackend};
use alife_chat::chat::{ChatTarget, ChatUpdate, PrivateChat};
use alife_chat::config::{HistoryConfig, ResolverConfig, RetryPolicy};
use alife_chat::session::{self, Session};
use alife_chat_proto::message::{ChatId, Timestamp, UserId};
use tokio::sync::watch;

use support::{MockBroker, WAIT, chat_message};

const BROADCAST: &str = "/topic/public";
const CHAT_C1: &str = "/topic/chat.c1";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn open_chat(
    broker: &MockBroker,
    backend: &Arc<InMemoryBackend>,
    session: watch::Receiver<Session>,
) -> PrivateChat<InMemoryBackend> {
    PrivateChat::new(
        broker.connection_config(),
        ResolverConfig {
            stale_after: Duration::from_secs(60),
            retry: fast_retry(),
        },
        HistoryConfig {
            stale_after: Duration::from_secs(60),
            retry: fast_retry(),
        },
        Arc::clone(backend),
        session,
    )
}

/// Applies updates until one matches `pred`, returning it.
async fn wait_update(
    chat: &mut PrivateChat<InMemoryBackend>,
    mut pred: impl FnMut(&ChatUpdate) -> bool,
) -> ChatUpdate {
    tokio::time::timeout(WAIT, async {
        loop {
            let update = chat.next_update().await.expect("connection manager gone");
            if pred(&update) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for chat update")
}

async fn wait_connected(chat: &mut PrivateChat<InMemoryBackend>) {
    wait_update(chat, |u| *u == ChatUpdate::Connected).await;
}

async fn wait_message(chat: &mut PrivateChat<InMemoryBackend>) -> ChatUpdate {
    wait_update(chat, |u| {
        matches!(u, ChatUpdate::Message(_) | ChatUpdate::Ignored)
    })
    .await
}

fn seed_conversation(backend: &InMemoryBackend) {
    let mut first = chat_message("m1", Some("c1"), "i1", "u1", "u2", "Hi, interested!");
    first.timestamp = Timestamp::from_millis(1_000);
    backend.record_message(&first);
    backend.set_peer_online(&ChatId::from("c1"), true);
}

// =============================================================================
// Conversation lifecycle
// =============================================================================

#[tokio::test]
async fn first_message_starts_conversation_for_both_sides() {
    let backend = Arc::new(InMemoryBackend::new());
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx_a, session_a) = session::channel(Session::authenticated("tok-a", "u1"));
    let mut buyer = open_chat(&broker, &backend, session_a);
    buyer.open(ChatTarget::new("i1", "u2")).await;
    wait_connected(&mut buyer).await;

    let (_tx_b, session_b) = session::channel(Session::authenticated("tok-b", "u2"));
    let mut seller = open_chat(&broker, &backend, session_b);
    seller.open(ChatTarget::new("i1", "u1")).await;
    wait_connected(&mut seller).await;

    assert_eq!(buyer.chat_id(), None);
    assert!(buyer.messages().is_empty());
    assert_eq!(buyer.error(), None);
    broker.wait_for_subscribers(BROADCAST, 2).await;

    // Buyer opens the conversation.
    let id = buyer.send_message("  Hi, interested!  ", true).unwrap();
    assert_eq!(buyer.pending_sends().len(), 1);
    assert_eq!(buyer.pending_sends()[0].id, id);
    assert_eq!(buyer.pending_sends()[0].content, "Hi, interested!");
    assert!(buyer.messages().is_empty());

    let ChatUpdate::Message(echo) = wait_message(&mut buyer).await else {
        panic!("echo was ignored");
    };
    assert_eq!(echo.content, "Hi, interested!");
    assert_eq!(echo.chat_id, Some(ChatId::from("c1")));
    assert_eq!(buyer.chat_id(), Some(&ChatId::from("c1")));
    assert!(buyer.pending_sends().is_empty());
    assert_eq!(buyer.messages(), vec![echo.clone()]);

    let ChatUpdate::Message(received) = wait_message(&mut seller).await else {
        panic!("seller ignored the first message");
    };
    assert_eq!(received, echo);
    assert_eq!(seller.chat_id(), Some(&ChatId::from("c1")));

    // Seller replies on the conversation topic.
    broker.wait_for_subscribers(CHAT_C1, 2).await;
    let reply_id = seller.send_message("Yes, still available", false).unwrap();

    let ChatUpdate::Message(reply) = wait_message(&mut buyer).await else {
        panic!("buyer ignored the reply");
    };
    assert_eq!(reply.id, reply_id);
    assert_eq!(reply.sender_id, UserId::from("u2"));

    let ChatUpdate::Message(own_reply) = wait_message(&mut seller).await else {
        panic!("seller ignored its own echo");
    };
    assert_eq!(own_reply.id, reply_id);
    assert!(seller.pending_sends().is_empty());

    let contents: Vec<String> = buyer.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, ["Hi, interested!", "Yes, still available"]);

    // Reloading merges persisted history with what was seen live.
    buyer.load_chat_history().await;
    assert_eq!(buyer.messages().len(), 2);
    assert_eq!(buyer.error(), None);

    buyer.close();
    seller.close();
}

#[tokio::test]
async fn late_participant_resolves_and_loads_history() {
    let backend = Arc::new(InMemoryBackend::new());
    seed_conversation(&backend);
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u2"));
    let mut seller = open_chat(&broker, &backend, session);
    seller.open(ChatTarget::new("i1", "u1")).await;

    assert!(!seller.is_loading());
    assert_eq!(seller.chat_id(), Some(&ChatId::from("c1")));
    assert!(seller.peer_online());
    let messages = seller.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hi, interested!");

    wait_connected(&mut seller).await;
    broker.wait_for_subscribers(CHAT_C1, 1).await;
    assert_eq!(seller.connection().conversation(), Some(ChatId::from("c1")));

    // A live message already in history is not shown twice.
    broker.publish(CHAT_C1, &messages[0]);
    wait_message(&mut seller).await;
    assert_eq!(seller.messages().len(), 1);
}

#[tokio::test]
async fn explicit_chat_id_skips_lookup() {
    let backend = Arc::new(InMemoryBackend::new());
    seed_conversation(&backend);
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u1"));
    let mut buyer = open_chat(&broker, &backend, session);
    buyer
        .open(ChatTarget::new("i1", "u2").with_chat_id("c1"))
        .await;

    assert_eq!(backend.calls(Endpoint::Resolve), 0);
    assert_eq!(buyer.chat_id(), Some(&ChatId::from("c1")));
    assert_eq!(buyer.messages().len(), 1);
}

// =============================================================================
// Isolation
// =============================================================================

#[tokio::test]
async fn unrelated_traffic_is_ignored() {
    let backend = Arc::new(InMemoryBackend::new());
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u1"));
    let mut buyer = open_chat(&broker, &backend, session);
    buyer
        .open(ChatTarget::new("i1", "u2").with_chat_id("c1"))
        .await;
    wait_connected(&mut buyer).await;
    broker.wait_for_subscribers(CHAT_C1, 1).await;

    // Another item.
    broker.publish(
        BROADCAST,
        &chat_message("x1", Some("c9"), "i2", "u2", "u1", "other item"),
    );
    // Another pair of users.
    broker.publish(
        BROADCAST,
        &chat_message("x2", Some("c8"), "i1", "u3", "u2", "other buyer"),
    );
    // Same pair and item, but another conversation id.
    broker.publish(
        BROADCAST,
        &chat_message("x3", Some("c7"), "i1", "u2", "u1", "stale conversation"),
    );
    for _ in 0..3 {
        assert_eq!(wait_message(&mut buyer).await, ChatUpdate::Ignored);
    }

    let mine = chat_message("y1", Some("c1"), "i1", "u2", "u1", "this one");
    broker.publish(CHAT_C1, &mine);
    assert_eq!(wait_message(&mut buyer).await, ChatUpdate::Message(mine.clone()));

    // Redelivery is ignored.
    broker.publish(CHAT_C1, &mine);
    assert_eq!(wait_message(&mut buyer).await, ChatUpdate::Ignored);
    assert_eq!(buyer.messages(), vec![mine]);
}

#[tokio::test]
async fn switching_conversation_drops_previous_state() {
    let backend = Arc::new(InMemoryBackend::new());
    seed_conversation(&backend);
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u2"));
    let mut seller = open_chat(&broker, &backend, session);
    seller.open(ChatTarget::new("i1", "u1")).await;
    wait_connected(&mut seller).await;
    assert_eq!(seller.messages().len(), 1);
    assert!(seller.peer_online());

    seller.open(ChatTarget::new("i2", "u3")).await;
    assert!(seller.messages().is_empty());
    assert_eq!(seller.chat_id(), None);
    assert!(!seller.peer_online());
    assert!(seller.pending_sends().is_empty());
    assert_eq!(seller.connection().conversation(), None);
    tokio::time::timeout(WAIT, async {
        while broker.subscribers(CHAT_C1) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old conversation still subscribed");

    // Traffic of the old conversation no longer lands here.
    broker.publish(
        BROADCAST,
        &chat_message("z1", Some("c1"), "i1", "u1", "u2", "anyone?"),
    );
    assert_eq!(wait_message(&mut seller).await, ChatUpdate::Ignored);
    assert!(seller.messages().is_empty());
}

// =============================================================================
// Backend interaction
// =============================================================================

#[tokio::test]
async fn mark_as_read_reaches_backend() {
    let backend = Arc::new(InMemoryBackend::new());
    seed_conversation(&backend);
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u2"));
    let mut seller = open_chat(&broker, &backend, session);
    seller.open(ChatTarget::new("i1", "u1")).await;

    seller.mark_as_read().unwrap().await.unwrap();
    assert_eq!(
        backend.reads(),
        vec![(ChatId::from("c1"), UserId::from("u2"))]
    );
}

#[tokio::test]
async fn mark_as_read_waits_for_a_conversation() {
    let backend = Arc::new(InMemoryBackend::new());
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u1"));
    let mut buyer = open_chat(&broker, &backend, session);
    buyer.open(ChatTarget::new("i1", "u2")).await;

    assert!(buyer.mark_as_read().is_none());
    assert_eq!(backend.calls(Endpoint::MarkAsRead), 0);
}

#[tokio::test]
async fn history_failure_is_reported_and_recovered() {
    let backend = Arc::new(InMemoryBackend::new());
    seed_conversation(&backend);
    backend.fail_next(Endpoint::History, BackendError::Invalid("bad json".into()));
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (_tx, session) = session::channel(Session::authenticated("tok", "u2"));
    let mut seller = open_chat(&broker, &backend, session);
    seller.open(ChatTarget::new("i1", "u1")).await;
    wait_connected(&mut seller).await;

    assert_eq!(
        seller.error().as_deref(),
        Some("invalid response: bad json")
    );
    assert!(seller.messages().is_empty());

    seller.load_chat_history().await;
    assert_eq!(seller.error(), None);
    assert_eq!(seller.messages().len(), 1);
}

#[tokio::test]
async fn nothing_is_fetched_without_a_token() {
    let backend = Arc::new(InMemoryBackend::new());
    seed_conversation(&backend);
    let broker = MockBroker::with_backend(Arc::clone(&backend)).await;

    let (tx, session) = session::channel(Session::loading());
    let mut seller = open_chat(&broker, &backend, session);
    seller.open(ChatTarget::new("i1", "u1")).await;

    assert_eq!(backend.calls(Endpoint::Resolve), 0);
    assert_eq!(backend.calls(Endpoint::History), 0);
    assert!(seller.messages().is_empty());
    assert!(!seller.is_connected());

    tx.send(Session::authenticated("tok", "u2")).unwrap();
    wait_connected(&mut seller).await;
    seller.load_chat_history().await;
    assert_eq!(seller.chat_id(), Some(&ChatId::from("c1")));
    assert_eq!(seller.messages().len(), 1);
}
