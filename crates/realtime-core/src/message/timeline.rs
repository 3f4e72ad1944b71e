//! Conversation state held by a message session
//!
//! Inbound messages are deduplicated twice: first by server id (skipped for
//! messages without one and for system notices), then, for private
//! messages only, by the `(sender, timestamp)` pair. The shared timeline is
//! kept ordered by timestamp with ties in arrival order.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{InboundMessage, MessageId, MessageStatus};

/// What [`Conversation::apply`] did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The id was seen before; nothing changed
    Duplicate,
    /// A join was recorded; `new` is false if the member was already known
    MemberJoined {
        /// Whether a membership entry was created
        new: bool,
    },
    /// Appended to the shared timeline
    AppendedShared,
    /// Appended to a private timeline
    AppendedPrivate,
    /// A private entry with the same sender and timestamp already exists
    SkippedContentDuplicate,
    /// Unrecognised status; nothing changed
    Ignored,
}

impl ApplyOutcome {
    /// Whether the message should be handed to the consumer
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::MemberJoined { .. }
                | ApplyOutcome::AppendedShared
                | ApplyOutcome::AppendedPrivate
        )
    }
}

/// Shared and private timelines of one channel
#[derive(Debug, Clone)]
pub struct Conversation {
    broadcast_receiver: String,
    shared: Vec<InboundMessage>,
    private: HashMap<String, Vec<InboundMessage>>,
    seen: HashSet<MessageId>,
}

impl Conversation {
    /// Create an empty conversation; messages addressed to
    /// `broadcast_receiver` go to the shared timeline
    pub fn new(broadcast_receiver: impl Into<String>) -> Self {
        Self {
            broadcast_receiver: broadcast_receiver.into(),
            shared: Vec::new(),
            private: HashMap::new(),
            seen: HashSet::new(),
        }
    }

    /// Merge one inbound message
    pub fn apply(&mut self, message: InboundMessage) -> ApplyOutcome {
        if message.status != MessageStatus::System {
            if let Some(id) = &message.id {
                if !self.seen.insert(id.clone()) {
                    return ApplyOutcome::Duplicate;
                }
            }
        }

        match message.status {
            MessageStatus::Join => {
                let new = !self.private.contains_key(&message.sender_id);
                self.private.entry(message.sender_id).or_default();
                ApplyOutcome::MemberJoined { new }
            }
            MessageStatus::Message => self.route(message, true),
            MessageStatus::System => self.route(message, false),
            MessageStatus::Other(_) => ApplyOutcome::Ignored,
        }
    }

    fn route(&mut self, message: InboundMessage, content_dedup: bool) -> ApplyOutcome {
        if message.receiver_key == self.broadcast_receiver {
            let at = self
                .shared
                .partition_point(|existing| existing.timestamp <= message.timestamp);
            self.shared.insert(at, message);
            return ApplyOutcome::AppendedShared;
        }

        let timeline = self.private.entry(message.receiver_key.clone()).or_default();
        if content_dedup && contains_entry(timeline, &message.sender_id, message.timestamp) {
            return ApplyOutcome::SkippedContentDuplicate;
        }
        timeline.push(message);
        ApplyOutcome::AppendedPrivate
    }

    /// Shared timeline in timestamp order
    pub fn shared(&self) -> &[InboundMessage] {
        &self.shared
    }

    /// Private timeline for a receiver, if any
    pub fn private(&self, receiver: &str) -> Option<&[InboundMessage]> {
        self.private.get(receiver).map(Vec::as_slice)
    }

    /// Number of ids recorded for dedup
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> ConversationSnapshot {
        let private: BTreeMap<String, Vec<InboundMessage>> = self
            .private
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ConversationSnapshot {
            members: private.keys().cloned().collect(),
            shared: self.shared.clone(),
            private,
            seen_ids: self.seen.len(),
        }
    }
}

fn contains_entry(timeline: &[InboundMessage], sender: &str, at: DateTime<Utc>) -> bool {
    timeline
        .iter()
        .any(|m| m.sender_id == sender && m.timestamp == at)
}

/// Point-in-time copy of a [`Conversation`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    /// Shared timeline in timestamp order
    pub shared: Vec<InboundMessage>,
    /// Private timelines keyed by receiver
    pub private: BTreeMap<String, Vec<InboundMessage>>,
    /// Known members and private peers, sorted
    pub members: Vec<String>,
    /// Number of ids recorded for dedup
    pub seen_ids: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, secs).unwrap()
    }

    fn message(id: Option<&str>, sender: &str, receiver: &str, secs: u32) -> InboundMessage {
        InboundMessage {
            id: id.map(MessageId::new),
            sender_id: sender.to_string(),
            receiver_key: receiver.to_string(),
            body: format!("{} says hi", sender),
            attachment: None,
            timestamp: at(secs),
            status: MessageStatus::Message,
        }
    }

    #[test]
    fn test_shared_timeline_is_sorted_and_stable() {
        let mut conv = Conversation::new("Chat chung");
        conv.apply(message(Some("1"), "a", "Chat chung", 30));
        conv.apply(message(Some("2"), "b", "Chat chung", 10));
        conv.apply(message(Some("3"), "c", "Chat chung", 30));
        conv.apply(message(Some("4"), "d", "Chat chung", 20));

        let senders: Vec<_> = conv.shared().iter().map(|m| m.sender_id.as_str()).collect();
        assert_eq!(senders, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_id_dedup() {
        let mut conv = Conversation::new("Chat chung");
        let msg = message(Some("m-1"), "a", "bob", 1);
        assert_eq!(conv.apply(msg.clone()), ApplyOutcome::AppendedPrivate);
        assert_eq!(conv.apply(msg.clone()), ApplyOutcome::Duplicate);
        assert_eq!(conv.apply(msg), ApplyOutcome::Duplicate);
        assert_eq!(conv.private("bob").map(<[_]>::len), Some(1));
    }

    #[test]
    fn test_private_content_dedup_without_ids() {
        let mut conv = Conversation::new("Chat chung");
        assert_eq!(conv.apply(message(None, "a", "bob", 1)), ApplyOutcome::AppendedPrivate);
        assert_eq!(
            conv.apply(message(None, "a", "bob", 1)),
            ApplyOutcome::SkippedContentDuplicate
        );
        assert_eq!(conv.apply(message(None, "b", "bob", 1)), ApplyOutcome::AppendedPrivate);
        assert_eq!(conv.private("bob").map(<[_]>::len), Some(2));
    }

    #[test]
    fn test_join_creates_empty_membership() {
        let mut conv = Conversation::new("Chat chung");
        let mut join = message(Some("j-1"), "carol", "Chat chung", 0);
        join.status = MessageStatus::Join;
        assert_eq!(conv.apply(join), ApplyOutcome::MemberJoined { new: true });

        let mut again = message(Some("j-2"), "carol", "Chat chung", 5);
        again.status = MessageStatus::Join;
        assert_eq!(conv.apply(again), ApplyOutcome::MemberJoined { new: false });

        let snapshot = conv.snapshot();
        assert_eq!(snapshot.members, vec!["carol".to_string()]);
        assert!(snapshot.private["carol"].is_empty());
        assert!(snapshot.shared.is_empty());
    }

    #[test]
    fn test_system_messages_skip_dedup() {
        let mut conv = Conversation::new("Chat chung");
        let mut notice = message(Some("s-1"), "system", "bob", 1);
        notice.status = MessageStatus::System;
        conv.apply(notice.clone());
        conv.apply(notice);
        assert_eq!(conv.private("bob").map(<[_]>::len), Some(2));
        assert_eq!(conv.seen_count(), 0);
    }

    #[test]
    fn test_unknown_status_is_ignored_but_id_recorded() {
        let mut conv = Conversation::new("Chat chung");
        let mut odd = message(Some("x-1"), "a", "Chat chung", 1);
        odd.status = MessageStatus::Other("TYPING".into());
        assert_eq!(conv.apply(odd), ApplyOutcome::Ignored);
        assert!(conv.shared().is_empty());
        assert_eq!(conv.seen_count(), 1);
    }
}
