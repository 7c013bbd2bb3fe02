//! Decides whether a tracked message has been answered.
//!
//! Checks run in a fixed priority order and stop at the first hit:
//! conversation id, then in-reply-to header, then the subject heuristic.
//! The subject heuristic is only consulted when both correlation checks are
//! inconclusive and is reported as `subject_match` so it can be audited.

use chrono::{DateTime, Utc};
use tracker_core::types::normalize_address;
use tracker_core::{DetectionMethod, IncomingMessageRecord, Result, TrackedMessage, TrackingStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Reply {
        method: DetectionMethod,
        record: IncomingMessageRecord,
    },
    NoReply,
}

impl Verdict {
    pub fn is_reply(&self) -> bool {
        matches!(self, Verdict::Reply { .. })
    }

    pub fn method(&self) -> Option<DetectionMethod> {
        match self {
            Verdict::Reply { method, .. } => Some(*method),
            Verdict::NoReply => None,
        }
    }
}

/// Removes any number of leading `Re:` markers, case-insensitively.
pub fn strip_reply_prefix(subject: &str) -> &str {
    let mut rest = subject.trim();
    loop {
        let marker_len = if rest.get(..3).map_or(false, |p| p.eq_ignore_ascii_case("re:")) {
            3
        } else if rest.get(..4).map_or(false, |p| p.eq_ignore_ascii_case("re :")) {
            4
        } else {
            return rest;
        };
        rest = rest[marker_len..].trim_start();
    }
}

fn subjects_match(tracked: &str, incoming: &str) -> bool {
    let tracked = strip_reply_prefix(tracked);
    !tracked.is_empty() && strip_reply_prefix(incoming).eq_ignore_ascii_case(tracked)
}

/// First record received after `after` that was not sent by `own_address`.
/// Input must already be ordered earliest first.
fn first_reply(
    records: Vec<IncomingMessageRecord>,
    own_address: &str,
    after: DateTime<Utc>,
) -> Option<IncomingMessageRecord> {
    records
        .into_iter()
        .find(|r| r.received_at > after && normalize_address(&r.sender_address) != own_address)
}

pub async fn detect_reply(store: &dyn TrackingStore, tracked: &TrackedMessage) -> Result<Verdict> {
    let own_address = normalize_address(&tracked.sender_address);

    if let Some(conversation_id) = &tracked.conversation_id {
        let records = store
            .incoming_in_conversation(&tracked.user_id, conversation_id, tracked.sent_at)
            .await?;
        if let Some(record) = first_reply(records, &own_address, tracked.sent_at) {
            return Ok(Verdict::Reply {
                method: DetectionMethod::ConversationId,
                record,
            });
        }
    } else if let Some(internet_message_id) = &tracked.internet_message_id {
        let records = store
            .incoming_replying_to(&tracked.user_id, internet_message_id)
            .await?;
        if let Some(record) = first_reply(records, &own_address, tracked.sent_at) {
            return Ok(Verdict::Reply {
                method: DetectionMethod::InReplyTo,
                record,
            });
        }
    }

    let recipient = normalize_address(&tracked.recipient_address);
    if recipient == own_address {
        return Ok(Verdict::NoReply);
    }
    let records = store
        .incoming_from_sender(&tracked.user_id, &recipient, tracked.sent_at)
        .await?;
    let heuristic = records
        .into_iter()
        .find(|r| r.received_at > tracked.sent_at && subjects_match(&tracked.subject, &r.subject));

    Ok(match heuristic {
        Some(record) => {
            tracing::debug!(
                "Subject heuristic matched {} to incoming {}",
                tracked.id,
                record.provider_message_id
            );
            Verdict::Reply {
                method: DetectionMethod::SubjectMatch,
                record,
            }
        }
        None => Verdict::NoReply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tracker_core::testing::{incoming, new_tracked};
    use tracker_core::MemoryStore;

    const ME: &str = "me@example.com";
    const LEAD: &str = "lead@example.com";

    async fn tracked_with(
        store: &MemoryStore,
        conversation_id: Option<&str>,
        internet_message_id: Option<&str>,
    ) -> TrackedMessage {
        let mut new = new_tracked("user-1", ME, LEAD, "Partnership proposal");
        new.conversation_id = conversation_id.map(str::to_string);
        new.internet_message_id = internet_message_id.map(str::to_string);
        store.insert_tracked(new).await.unwrap()
    }

    #[test]
    fn strips_repeated_reply_markers() {
        assert_eq!(strip_reply_prefix("Re: RE: re : Hello"), "Hello");
        assert_eq!(strip_reply_prefix("Regarding the offer"), "Regarding the offer");
        assert_eq!(strip_reply_prefix("  Fwd: Hello"), "Fwd: Hello");
        assert_eq!(strip_reply_prefix("Ré: Hi"), "Ré: Hi");
    }

    #[tokio::test]
    async fn conversation_match_wins_over_subject_match() {
        let store = MemoryStore::new();
        let tracked = tracked_with(&store, Some("conv-1"), None).await;

        let mut by_subject = incoming(
            "user-1",
            "m-subject",
            LEAD,
            "RE: Partnership proposal",
            tracked.sent_at + Duration::minutes(5),
        );
        by_subject.conversation_id = Some("conv-other".into());
        store.insert_incoming(&by_subject).await.unwrap();

        let mut by_thread = incoming(
            "user-1",
            "m-thread",
            "assistant@example.com",
            "Out of office",
            tracked.sent_at + Duration::minutes(30),
        );
        by_thread.conversation_id = Some("conv-1".into());
        store.insert_incoming(&by_thread).await.unwrap();

        let verdict = detect_reply(&store, &tracked).await.unwrap();
        assert_eq!(verdict.method(), Some(DetectionMethod::ConversationId));
        match verdict {
            Verdict::Reply { record, .. } => assert_eq!(record.provider_message_id, "m-thread"),
            Verdict::NoReply => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn own_sent_copy_in_conversation_is_not_a_reply() {
        let store = MemoryStore::new();
        let tracked = tracked_with(&store, Some("conv-1"), None).await;

        let mut self_copy = incoming(
            "user-1",
            "m-self",
            "Me <ME@example.com>",
            "Partnership proposal",
            tracked.sent_at + Duration::seconds(10),
        );
        self_copy.conversation_id = Some("conv-1".into());
        store.insert_incoming(&self_copy).await.unwrap();

        let verdict = detect_reply(&store, &tracked).await.unwrap();
        assert_eq!(verdict, Verdict::NoReply);
    }

    #[tokio::test]
    async fn earliest_reply_in_conversation_is_reported() {
        let store = MemoryStore::new();
        let tracked = tracked_with(&store, Some("conv-1"), None).await;

        for (id, minutes) in [("late", 90), ("early", 15), ("middle", 45)] {
            let mut record = incoming("user-1", id, LEAD, "Re: x", tracked.sent_at + Duration::minutes(minutes));
            record.conversation_id = Some("conv-1".into());
            store.insert_incoming(&record).await.unwrap();
        }

        match detect_reply(&store, &tracked).await.unwrap() {
            Verdict::Reply { record, .. } => assert_eq!(record.provider_message_id, "early"),
            Verdict::NoReply => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn in_reply_to_used_when_conversation_unknown() {
        let store = MemoryStore::new();
        let tracked = tracked_with(&store, None, Some("<orig@mail.example.com>")).await;

        let mut record = incoming(
            "user-1",
            "m-1",
            "someone-else@example.com",
            "Different subject",
            tracked.sent_at + Duration::hours(1),
        );
        record.in_reply_to = Some("<orig@mail.example.com>".into());
        store.insert_incoming(&record).await.unwrap();

        let verdict = detect_reply(&store, &tracked).await.unwrap();
        assert_eq!(verdict.method(), Some(DetectionMethod::InReplyTo));
    }

    #[tokio::test]
    async fn subject_heuristic_requires_recipient_and_later_receipt() {
        let store = MemoryStore::new();
        let tracked = tracked_with(&store, None, None).await;

        let before_send = incoming(
            "user-1",
            "m-old",
            LEAD,
            "Re: Partnership proposal",
            tracked.sent_at - Duration::minutes(1),
        );
        let wrong_sender = incoming(
            "user-1",
            "m-other",
            "stranger@example.com",
            "Re: Partnership proposal",
            tracked.sent_at + Duration::minutes(1),
        );
        store.insert_incoming(&before_send).await.unwrap();
        store.insert_incoming(&wrong_sender).await.unwrap();
        assert_eq!(detect_reply(&store, &tracked).await.unwrap(), Verdict::NoReply);

        let reply = incoming(
            "user-1",
            "m-reply",
            LEAD,
            "RE: partnership PROPOSAL",
            tracked.sent_at + Duration::minutes(2),
        );
        store.insert_incoming(&reply).await.unwrap();
        assert_eq!(
            detect_reply(&store, &tracked).await.unwrap().method(),
            Some(DetectionMethod::SubjectMatch)
        );
    }

    #[tokio::test]
    async fn records_of_other_users_are_ignored() {
        let store = MemoryStore::new();
        let tracked = tracked_with(&store, Some("conv-1"), None).await;

        let mut foreign = incoming("user-2", "m-1", LEAD, "Re: Partnership proposal", Utc::now());
        foreign.conversation_id = Some("conv-1".into());
        store.insert_incoming(&foreign).await.unwrap();

        assert_eq!(detect_reply(&store, &tracked).await.unwrap(), Verdict::NoReply);
    }
}
