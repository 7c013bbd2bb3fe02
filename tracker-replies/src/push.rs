use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

use tracker_core::types::normalize_address;
use tracker_core::{
    IncomingMessageRecord, Lookup, Result, TrackedMessage, TrackerContext, TrackerError,
    TrackingEvent,
};

use crate::backfill::backfill_message_ids;
use crate::ingest::{ingest, parse_notifications, validate_client_state, ChangeNotification, IncomingSignal};
use crate::reconciler::Reconciler;
use crate::sync::resolve_tracked;

/// Notifications handled at once within one webhook call.
const NOTIFICATION_CONCURRENCY: usize = 8;

/// Time budget for one webhook body. The provider redelivers when acks are slow.
pub const WEBHOOK_DEADLINE: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookReport {
    pub processed: usize,
    pub updated: usize,
    pub errors: usize,
}

/// Could `record` answer `tracked`? Cheap pre-filter before full detection.
fn may_answer(tracked: &TrackedMessage, record: &IncomingMessageRecord) -> bool {
    let same_conversation = matches!(
        (&tracked.conversation_id, &record.conversation_id),
        (Some(a), Some(b)) if a == b
    );
    let replies_to = matches!(
        (&tracked.internet_message_id, &record.in_reply_to),
        (Some(a), Some(b)) if a == b
    );
    same_conversation || replies_to || normalize_address(&tracked.recipient_address) == record.sender_address
}

/// Handles one notification end to end. Returns how many tracked messages
/// it moved to replied.
async fn handle_notification(ctx: &TrackerContext, notification: &ChangeNotification) -> Result<usize> {
    if let Err(e) = validate_client_state(
        ctx.config.provider.client_state.as_deref(),
        notification.client_state.as_deref(),
    ) {
        tracing::warn!(
            "Rejected notification for subscription {}: client state mismatch",
            notification.subscription_id
        );
        let event = TrackingEvent::new(
            "webhook.rejected",
            json!({"subscription_id": notification.subscription_id, "reason": e.kind()}),
        );
        if let Err(audit_err) = ctx.store.append_event(event).await {
            tracing::warn!("Failed to audit rejected notification: {}", audit_err);
        }
        return Err(e);
    }

    let subscription = ctx
        .store
        .get_subscription(&notification.subscription_id)
        .await?
        .ok_or_else(|| TrackerError::NotFound(format!("subscription {}", notification.subscription_id)))?;
    let user_id = subscription.user_id.as_str();

    let resource = notification.message_resource().ok_or_else(|| {
        TrackerError::MalformedSignal(format!(
            "notification for {} names no message",
            notification.subscription_id
        ))
    })?;

    let token = ctx.tokens.access_token(user_id).await?;
    let message = match ctx.provider.get_message(&token, &resource).await? {
        Lookup::Found(message) => message,
        Lookup::NotFound => {
            tracing::debug!("Message {} vanished before it could be fetched", resource);
            return Ok(0);
        }
    };

    let records = ingest(ctx.store.as_ref(), &IncomingSignal::push(user_id, vec![message.clone()]))
        .await
        .into_result()?;
    if records.is_empty() {
        return Ok(0);
    }

    let pending = ctx.store.pending_for_user(user_id).await?;
    let mailbox = ctx.tokens.mailbox_address(user_id).await?;
    let reconciler = Reconciler::new(ctx.store.clone());
    let mut updated = 0;

    for record in &records {
        let own = mailbox.as_deref() == Some(record.sender_address.as_str())
            || pending
                .iter()
                .any(|t| normalize_address(&t.sender_address) == record.sender_address);
        if own {
            backfill_message_ids(ctx.store.as_ref(), &pending, std::slice::from_ref(&message)).await;
            continue;
        }

        for tracked in pending.iter().filter(|t| may_answer(t, record)) {
            if resolve_tracked(ctx, &reconciler, tracked.id).await? {
                updated += 1;
            }
        }
    }

    Ok(updated)
}

/// Processes a webhook body within [`WEBHOOK_DEADLINE`].
pub async fn process_notifications(ctx: &TrackerContext, body: &Value) -> WebhookReport {
    process_notifications_until(ctx, body, Instant::now() + WEBHOOK_DEADLINE).await
}

/// Processes a webhook body. Each notification is handled on its own; a bad
/// one is counted and logged without affecting the others. Notifications
/// still running at `deadline` are abandoned and counted as errors; the
/// sync sweep later finds whatever they would have.
pub async fn process_notifications_until(
    ctx: &TrackerContext,
    body: &Value,
    deadline: Instant,
) -> WebhookReport {
    let mut report = WebhookReport::default();
    let mut notifications = Vec::new();

    for parsed in parse_notifications(body) {
        match parsed {
            Ok(notification) => notifications.push(notification),
            Err(e) => {
                tracing::warn!("Dropping notification: {}", e);
                report.errors += 1;
            }
        }
    }

    let results: Vec<(String, Result<usize>)> = stream::iter(notifications)
        .map(|notification| async move {
            let result = match tokio::time::timeout_at(deadline, handle_notification(ctx, &notification)).await {
                Ok(result) => result,
                Err(_) => Err(TrackerError::TransientNetwork(
                    "webhook deadline reached".to_string(),
                )),
            };
            (notification.subscription_id, result)
        })
        .buffer_unordered(NOTIFICATION_CONCURRENCY)
        .collect()
        .await;

    for (subscription_id, result) in results {
        match result {
            Ok(updated) => {
                report.processed += 1;
                report.updated += updated;
            }
            Err(e) => {
                if !matches!(e, TrackerError::InvalidClientState) {
                    tracing::error!("Notification for subscription {} failed: {}", subscription_id, e);
                }
                report.errors += 1;
            }
        }
    }

    tracing::debug!(
        "Webhook batch: processed={}, updated={}, errors={}",
        report.processed,
        report.updated,
        report.errors
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tracker_core::testing::{
        new_tracked, provider_message, test_context, valid_token, FakeProvider, FaultyStore,
        CLIENT_STATE,
    };
    use tracker_core::{
        DetectionMethod, MemoryStore, Subscription, SubscriptionStatus, TrackingStatus, TrackingStore,
    };

    use crate::sync::sync_all_pending_replies;

    async fn subscribed_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        subscribe(&store).await;
        store
    }

    async fn subscribe(store: &MemoryStore) {
        store.put_token(valid_token("user-1", "me@example.com")).await;
        store
            .insert_subscription(&Subscription {
                subscription_id: "sub-1".into(),
                user_id: "user-1".into(),
                resource: "me/messages".into(),
                change_types: "created".into(),
                expires_at: Utc::now() + Duration::days(2),
                status: SubscriptionStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn notification(message_id: &str, client_state: &str) -> Value {
        json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": client_state,
                "changeType": "created",
                "resource": format!("me/messages/{}", message_id),
                "resourceData": {"id": message_id}
            }]
        })
    }

    #[tokio::test]
    async fn poll_backfill_then_push_reply_marks_replied_at_reply_time() {
        let store = subscribed_store().await;
        let provider = Arc::new(FakeProvider::new());
        let ctx = test_context(store.clone(), provider.clone());

        // T0: sent without any provider identifiers.
        let tracked = store
            .insert_tracked(new_tracked("user-1", "me@example.com", "lead@example.com", "Quarterly review"))
            .await
            .unwrap();
        let t0 = tracked.sent_at;

        // T1: the poll sweep sees the sent copy and learns the conversation.
        provider.add_sent(provider_message(
            "sent-1",
            "conv-C",
            "me@example.com",
            "lead@example.com",
            "Quarterly review",
            t0 + Duration::seconds(5),
        ));
        let sweep = sync_all_pending_replies(&ctx, 30).await.unwrap();
        assert_eq!(sweep.updated, 0);
        let after_poll = store.get_tracked(tracked.id).await.unwrap().unwrap();
        assert_eq!(after_poll.conversation_id.as_deref(), Some("conv-C"));
        assert_eq!(after_poll.status, TrackingStatus::Pending);

        // T2: the recipient answers in that conversation with a new subject.
        let t2 = t0 + Duration::minutes(90);
        provider.add_message(provider_message(
            "reply-1",
            "conv-C",
            "lead@example.com",
            "me@example.com",
            "Numbers attached",
            t2,
        ));
        let report = process_notifications(&ctx, &notification("reply-1", CLIENT_STATE)).await;
        assert_eq!(report, WebhookReport { processed: 1, updated: 1, errors: 0 });

        let stored = store.get_tracked(tracked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Replied);
        assert_eq!(stored.reply_method, Some(DetectionMethod::ConversationId));
        assert_eq!(stored.conversation_id.as_deref(), Some("conv-C"));
        assert_eq!(stored.reply_received_at, Some(t2));
    }

    #[tokio::test]
    async fn wrong_client_state_is_rejected_and_audited() {
        let store = subscribed_store().await;
        let provider = Arc::new(FakeProvider::new());
        let ctx = test_context(store.clone(), provider.clone());
        let tracked = store
            .insert_tracked(new_tracked("user-1", "me@example.com", "lead@example.com", "Hello"))
            .await
            .unwrap();
        provider.add_message(provider_message(
            "reply-1",
            "conv-1",
            "lead@example.com",
            "me@example.com",
            "Re: Hello",
            Utc::now(),
        ));

        let report = process_notifications(&ctx, &notification("reply-1", "forged")).await;
        assert_eq!(report, WebhookReport { processed: 0, updated: 0, errors: 1 });

        let stored = store.get_tracked(tracked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Pending);
        assert_eq!(store.incoming_count().await, 0);
        assert!(store.events().await.iter().any(|e| e.event_type == "webhook.rejected"));
    }

    #[tokio::test]
    async fn own_sent_copy_backfills_and_never_replies() {
        let store = subscribed_store().await;
        let provider = Arc::new(FakeProvider::new());
        let ctx = test_context(store.clone(), provider.clone());
        let tracked = store
            .insert_tracked(new_tracked("user-1", "me@example.com", "lead@example.com", "Hello"))
            .await
            .unwrap();
        provider.add_message(provider_message(
            "sent-1",
            "conv-1",
            "Me <me@example.com>",
            "lead@example.com",
            "Hello",
            tracked.sent_at,
        ));

        let report = process_notifications(&ctx, &notification("sent-1", CLIENT_STATE)).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.updated, 0);

        let stored = store.get_tracked(tracked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Pending);
        assert_eq!(stored.conversation_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn bad_items_are_isolated_within_a_batch() {
        let store = subscribed_store().await;
        let provider = Arc::new(FakeProvider::new());
        let ctx = test_context(store.clone(), provider);

        let body = json!({
            "value": [
                {"changeType": "created"},
                {"subscriptionId": "sub-unknown", "clientState": CLIENT_STATE, "resourceData": {"id": "x"}},
                {"subscriptionId": "sub-1", "clientState": CLIENT_STATE, "resource": "me/messages/gone"}
            ]
        });
        let report = process_notifications(&ctx, &body).await;
        assert_eq!(report, WebhookReport { processed: 1, updated: 0, errors: 2 });
    }

    #[tokio::test]
    async fn store_failure_while_ingesting_counts_as_error() {
        let store = Arc::new(FaultyStore::new());
        subscribe(&store.inner).await;
        store.fail_incoming_inserts(true);
        let provider = Arc::new(FakeProvider::new());
        let ctx = test_context(store.clone(), provider.clone());
        provider.add_message(provider_message(
            "reply-1",
            "conv-1",
            "lead@example.com",
            "me@example.com",
            "Re: Hello",
            Utc::now(),
        ));

        let report = process_notifications(&ctx, &notification("reply-1", CLIENT_STATE)).await;
        assert_eq!(report, WebhookReport { processed: 0, updated: 0, errors: 1 });

        store.fail_incoming_inserts(false);
        let report = process_notifications(&ctx, &notification("reply-1", CLIENT_STATE)).await;
        assert_eq!(report, WebhookReport { processed: 1, updated: 0, errors: 0 });
        assert_eq!(store.inner.incoming_count().await, 1);
    }

    #[tokio::test]
    async fn slow_fetches_are_cut_off_at_the_deadline() {
        let store = subscribed_store().await;
        let provider = Arc::new(FakeProvider::new());
        provider.delay_messages(std::time::Duration::from_secs(30));
        let ctx = test_context(store.clone(), provider.clone());
        for id in ["reply-1", "reply-2"] {
            provider.add_message(provider_message(
                id,
                "conv-1",
                "lead@example.com",
                "me@example.com",
                "Re: Hello",
                Utc::now(),
            ));
        }
        let mut body = notification("reply-1", CLIENT_STATE);
        let second = notification("reply-2", CLIENT_STATE)["value"][0].clone();
        body["value"].as_array_mut().unwrap().push(second);

        let started = Instant::now();
        let report =
            process_notifications_until(&ctx, &body, started + std::time::Duration::from_millis(100)).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(report, WebhookReport { processed: 0, updated: 0, errors: 2 });
    }
}
