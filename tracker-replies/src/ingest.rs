//! Normalizes everything that arrives from outside into one signal shape.
//!
//! Raw provider payloads stop here. Downstream code only ever sees
//! [`IncomingMessageRecord`]s, and nothing in this module returns an error for
//! bad input: unusable items are logged and dropped. Store failures are a
//! different matter and are handed back in [`Ingested`].

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use tracker_core::provider::ProviderMessage;
use tracker_core::types::normalize_address;
use tracker_core::{DetectionMethod, IncomingMessageRecord, TrackerError, TrackingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Push,
    Poll,
    Pixel,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Push => "push",
            SignalKind::Poll => "poll",
            SignalKind::Pixel => "pixel",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SignalPayload {
    /// Provider messages fetched for a push notification or a poll pass.
    Messages(Vec<ProviderMessage>),
    /// A pixel load or link click on a tracked message.
    Engagement {
        tracked_id: Uuid,
        method: DetectionMethod,
    },
}

#[derive(Debug, Clone)]
pub struct IncomingSignal {
    pub kind: SignalKind,
    pub user_id: Option<String>,
    pub payload: SignalPayload,
    pub received_at: DateTime<Utc>,
}

impl IncomingSignal {
    pub fn push(user_id: &str, messages: Vec<ProviderMessage>) -> Self {
        Self::messages(SignalKind::Push, user_id, messages)
    }

    pub fn poll(user_id: &str, messages: Vec<ProviderMessage>) -> Self {
        Self::messages(SignalKind::Poll, user_id, messages)
    }

    pub fn engagement(tracked_id: Uuid, method: DetectionMethod) -> Self {
        IncomingSignal {
            kind: SignalKind::Pixel,
            user_id: None,
            payload: SignalPayload::Engagement { tracked_id, method },
            received_at: Utc::now(),
        }
    }

    fn messages(kind: SignalKind, user_id: &str, messages: Vec<ProviderMessage>) -> Self {
        IncomingSignal {
            kind,
            user_id: Some(user_id.to_string()),
            payload: SignalPayload::Messages(messages),
            received_at: Utc::now(),
        }
    }
}

/// Turns one provider message into a record, or `None` if it lacks an id,
/// a sender, or any timestamp.
pub fn normalize(user_id: &str, message: &ProviderMessage) -> Option<IncomingMessageRecord> {
    let provider_message_id = message.id.as_deref().filter(|id| !id.is_empty())?;
    let sender = message.sender().filter(|s| !s.trim().is_empty())?;
    let received_at = message.received_date_time.or(message.sent_date_time)?;

    Some(IncomingMessageRecord {
        user_id: user_id.to_string(),
        provider_message_id: provider_message_id.to_string(),
        conversation_id: message.conversation_id.clone().filter(|c| !c.is_empty()),
        internet_message_id: message.internet_message_id.clone().filter(|i| !i.is_empty()),
        in_reply_to: message.header("In-Reply-To").map(|v| v.trim().to_string()),
        sender_address: normalize_address(sender),
        recipient_address: message.first_recipient().map(normalize_address).unwrap_or_default(),
        subject: message.subject.clone().unwrap_or_default(),
        received_at,
        body_preview: message.body_preview.clone().unwrap_or_default(),
        is_read: message.is_read.unwrap_or(false),
    })
}

/// Outcome of one [`ingest`] call.
#[derive(Debug, Default)]
pub struct Ingested {
    /// Records stored by this call. Already known messages are not repeated.
    pub fresh: Vec<IncomingMessageRecord>,
    /// Provider message ids the store failed to take.
    pub failed: Vec<(String, TrackerError)>,
}

impl Ingested {
    /// The fresh records, or the first store failure.
    pub fn into_result(self) -> Result<Vec<IncomingMessageRecord>, TrackerError> {
        match self.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(self.fresh),
        }
    }
}

/// Persists the usable messages of `signal`. Unusable messages are dropped;
/// store failures are collected per message so the rest still get stored.
pub async fn ingest(store: &dyn TrackingStore, signal: &IncomingSignal) -> Ingested {
    let (user_id, messages) = match (&signal.user_id, &signal.payload) {
        (Some(user_id), SignalPayload::Messages(messages)) => (user_id, messages),
        (None, SignalPayload::Messages(_)) => {
            tracing::warn!("Dropping {} signal without a user", signal.kind.as_str());
            return Ingested::default();
        }
        (_, SignalPayload::Engagement { .. }) => return Ingested::default(),
    };

    let mut ingested = Ingested::default();
    for message in messages {
        let record = match normalize(user_id, message) {
            Some(record) => record,
            None => {
                tracing::debug!(
                    "Skipping unusable {} message {:?} for {}",
                    signal.kind.as_str(),
                    message.id,
                    user_id
                );
                continue;
            }
        };

        match store.insert_incoming(&record).await {
            Ok(true) => ingested.fresh.push(record),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    "Failed to store incoming message {} for {}: {}",
                    record.provider_message_id,
                    user_id,
                    e
                );
                ingested.failed.push((record.provider_message_id, e));
            }
        }
    }

    if !ingested.fresh.is_empty() {
        tracing::debug!(
            "Ingested {} new {} message(s) for {}",
            ingested.fresh.len(),
            signal.kind.as_str(),
            user_id
        );
    }
    ingested
}

/// One change notification as delivered to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub subscription_id: String,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub resource_data: Option<ResourceData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceData {
    #[serde(default)]
    pub id: Option<String>,
}

impl ChangeNotification {
    /// Resource path of the changed message, built from `resourceData.id`
    /// when the notification carries no usable `resource`.
    pub fn message_resource(&self) -> Option<String> {
        if let Some(resource) = self.resource.as_deref().filter(|r| !r.is_empty()) {
            return Some(resource.to_string());
        }
        self.resource_data
            .as_ref()?
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("me/messages/{}", id))
    }
}

/// Splits a webhook body into notifications. Items that do not parse are
/// returned as errors so the caller can count them without losing the rest.
pub fn parse_notifications(body: &Value) -> Vec<Result<ChangeNotification, TrackerError>> {
    let items = match body.get("value").and_then(Value::as_array) {
        Some(items) => items,
        None => {
            return vec![Err(TrackerError::MalformedSignal(
                "notification body has no value array".to_string(),
            ))]
        }
    };

    items
        .iter()
        .map(|item| {
            serde_json::from_value::<ChangeNotification>(item.clone())
                .map_err(|e| TrackerError::MalformedSignal(format!("unreadable notification: {}", e)))
        })
        .collect()
}

/// Rejects notifications whose client state does not match the configured
/// secret. Without a configured secret nothing is accepted.
pub fn validate_client_state(expected: Option<&str>, received: Option<&str>) -> Result<(), TrackerError> {
    match (expected, received) {
        (Some(expected), Some(received)) if expected == received => Ok(()),
        _ => Err(TrackerError::InvalidClientState),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tracker_core::provider::MessageHeader;
    use tracker_core::testing::{provider_message, FaultyStore};
    use tracker_core::MemoryStore;

    #[test]
    fn normalize_requires_id_sender_and_time() {
        let now = Utc::now();
        let good = provider_message("m-1", "conv-1", "Lead <LEAD@example.com>", "me@example.com", "Hi", now);
        let record = normalize("user-1", &good).unwrap();
        assert_eq!(record.sender_address, "lead@example.com");
        assert_eq!(record.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(record.received_at, now);

        let mut no_id = good.clone();
        no_id.id = None;
        assert!(normalize("user-1", &no_id).is_none());

        let mut no_sender = good.clone();
        no_sender.from = None;
        assert!(normalize("user-1", &no_sender).is_none());

        let mut no_time = good;
        no_time.received_date_time = None;
        no_time.sent_date_time = None;
        assert!(normalize("user-1", &no_time).is_none());
    }

    #[test]
    fn normalize_reads_in_reply_to_header() {
        let mut message = provider_message("m-1", "", "a@example.com", "b@example.com", "Re: x", Utc::now());
        message.internet_message_headers.push(MessageHeader {
            name: "in-reply-to".into(),
            value: " <orig@mail.example.com> ".into(),
        });
        let record = normalize("user-1", &message).unwrap();
        assert_eq!(record.in_reply_to.as_deref(), Some("<orig@mail.example.com>"));
        assert_eq!(record.conversation_id, None);
    }

    #[tokio::test]
    async fn same_message_ingested_twice_is_stored_once() {
        let store = MemoryStore::new();
        let message = provider_message(
            "m-1",
            "conv-1",
            "lead@example.com",
            "me@example.com",
            "Re: Proposal",
            Utc::now() - Duration::minutes(3),
        );

        let first = ingest(&store, &IncomingSignal::push("user-1", vec![message.clone()])).await;
        let second = ingest(&store, &IncomingSignal::poll("user-1", vec![message])).await;

        assert_eq!(first.fresh.len(), 1);
        assert!(second.fresh.is_empty());
        assert!(second.failed.is_empty());
        assert_eq!(store.incoming_count().await, 1);
    }

    #[tokio::test]
    async fn unusable_items_do_not_block_the_rest() {
        let store = MemoryStore::new();
        let broken = ProviderMessage::default();
        let good = provider_message("m-2", "conv-1", "lead@example.com", "me@example.com", "x", Utc::now());

        let records = ingest(&store, &IncomingSignal::poll("user-1", vec![broken, good]))
            .await
            .into_result()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_message_id, "m-2");
    }

    #[tokio::test]
    async fn engagement_signals_yield_no_records() {
        let store = MemoryStore::new();
        let signal = IncomingSignal::engagement(Uuid::new_v4(), DetectionMethod::PixelOpen);
        assert!(ingest(&store, &signal).await.fresh.is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_reported_not_mistaken_for_duplicates() {
        let store = FaultyStore::new();
        store.fail_incoming_inserts(true);
        let message = provider_message("m-1", "conv-1", "lead@example.com", "me@example.com", "Re: x", Utc::now());

        let ingested = ingest(&store, &IncomingSignal::push("user-1", vec![message])).await;
        assert!(ingested.fresh.is_empty());
        assert_eq!(ingested.failed.len(), 1);
        assert_eq!(ingested.failed[0].0, "m-1");
        assert!(matches!(ingested.into_result(), Err(TrackerError::Store(_))));
    }

    #[test]
    fn notifications_parse_item_by_item() {
        let body = json!({
            "value": [
                {
                    "subscriptionId": "sub-1",
                    "clientState": "secret",
                    "changeType": "created",
                    "resource": "Users/abc/Messages/m-1",
                    "resourceData": {"id": "m-1"}
                },
                {"changeType": "created"},
                {"subscriptionId": "sub-1", "resourceData": {"id": "m-2"}}
            ]
        });

        let parsed = parse_notifications(&body);
        assert_eq!(parsed.len(), 3);
        assert_eq!(
            parsed[0].as_ref().unwrap().message_resource().as_deref(),
            Some("Users/abc/Messages/m-1")
        );
        assert!(matches!(parsed[1], Err(TrackerError::MalformedSignal(_))));
        assert_eq!(
            parsed[2].as_ref().unwrap().message_resource().as_deref(),
            Some("me/messages/m-2")
        );

        assert_eq!(parse_notifications(&json!({"nope": 1})).len(), 1);
    }

    #[test]
    fn client_state_must_match_configured_secret() {
        assert!(validate_client_state(Some("s"), Some("s")).is_ok());
        assert_eq!(
            validate_client_state(Some("s"), Some("other")),
            Err(TrackerError::InvalidClientState)
        );
        assert_eq!(validate_client_state(Some("s"), None), Err(TrackerError::InvalidClientState));
        assert_eq!(validate_client_state(None, Some("s")), Err(TrackerError::InvalidClientState));
    }
}
