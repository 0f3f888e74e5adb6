//! Property-based tests for conversation timeline reconciliation.
//!
//! Uses proptest to verify, for arbitrary history and live lists:
//! 1. The merged view never contains the same message id twice.
//! 2. The merged view is ordered by timestamp.
//! 3. Every id from either input appears in the merged view.
//! 4. Messages outside the selected conversation never enter the timeline.

use std::collections::HashSet;

use alife_chat::chat::timeline::{ConversationKey, Timeline, merge};
use alife_chat_proto::message::*;
use proptest::prelude::*;

/// Small id and clock ranges so duplicates and ties actually happen.
fn arb_message() -> impl Strategy<Value = ChatMessage> {
    (0u8..20, 0i64..50, any::<bool>(), "[a-z ]{1,20}").prop_map(|(id, at, outgoing, content)| {
        let (from, to) = if outgoing { ("u1", "u2") } else { ("u2", "u1") };
        ChatMessage {
            id: MessageId::new(format!("m{id}")),
            chat_id: Some(ChatId::from("c1")),
            item_id: ItemId::from("i1"),
            sender_id: UserId::from(from),
            sender_name: None,
            recipient_id: UserId::from(to),
            content,
            message_type: MessageType::Chat,
            timestamp: Timestamp::from_millis(at),
        }
    })
}

/// Messages that differ from the selected conversation in one way.
fn arb_foreign_message() -> impl Strategy<Value = ChatMessage> {
    (arb_message(), 0u8..3).prop_map(|(mut msg, how)| {
        match how {
            0 => msg.item_id = ItemId::from("i2"),
            1 => msg.sender_id = UserId::from("u3"),
            _ => msg.chat_id = Some(ChatId::from("c2")),
        }
        msg
    })
}

fn selected_timeline() -> Timeline {
    let mut timeline = Timeline::new();
    timeline.set_own_id(Some(UserId::from("u1")));
    timeline.select(ConversationKey::new("i1", "u2"));
    timeline.set_chat_id(Some(ChatId::from("c1")));
    timeline
}

proptest! {
    #[test]
    fn merge_has_unique_ids(
        history in prop::collection::vec(arb_message(), 0..30),
        live in prop::collection::vec(arb_message(), 0..30),
    ) {
        let merged = merge(&history, &live);
        let mut seen = HashSet::new();
        for msg in &merged {
            prop_assert!(seen.insert(msg.id.clone()), "duplicate id {}", msg.id);
        }
    }

    #[test]
    fn merge_is_time_ordered(
        history in prop::collection::vec(arb_message(), 0..30),
        live in prop::collection::vec(arb_message(), 0..30),
    ) {
        let merged = merge(&history, &live);
        for pair in merged.windows(2) {
            prop_assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn merge_loses_no_id(
        history in prop::collection::vec(arb_message(), 0..30),
        live in prop::collection::vec(arb_message(), 0..30),
    ) {
        let merged: HashSet<MessageId> = merge(&history, &live).into_iter().map(|m| m.id).collect();
        let expected: HashSet<MessageId> =
            history.iter().chain(&live).map(|m| m.id.clone()).collect();
        prop_assert_eq!(merged, expected);
    }

    #[test]
    fn foreign_messages_never_enter_timeline(
        own in prop::collection::vec(arb_message(), 0..20),
        foreign in prop::collection::vec(arb_foreign_message(), 0..20),
    ) {
        let mut timeline = selected_timeline();
        for msg in own.iter().chain(&foreign) {
            timeline.accept(msg.clone());
        }
        for msg in timeline.messages() {
            prop_assert_eq!(&msg.item_id, &ItemId::from("i1"));
            prop_assert_eq!(msg.chat_id.as_ref(), Some(&ChatId::from("c1")));
            prop_assert!(msg.is_between(&UserId::from("u1"), &UserId::from("u2")));
        }
    }

    #[test]
    fn accepting_twice_changes_nothing(
        live in prop::collection::vec(arb_message(), 0..30),
    ) {
        let mut timeline = selected_timeline();
        for msg in &live {
            timeline.accept(msg.clone());
        }
        let once = timeline.messages();
        for msg in &live {
            prop_assert!(!timeline.accept(msg.clone()));
        }
        prop_assert_eq!(timeline.messages(), once);
    }
}
