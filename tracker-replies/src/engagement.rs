//! Pixel opens and link clicks.
//!
//! Callers on the HTTP side run this detached from the response; whatever
//! happens here must never reach the recipient's mail client or browser.

use serde_json::json;
use uuid::Uuid;

use tracker_core::{
    DetectionMethod, Result, TrackerContext, TrackerError, TrackingEvent, TrackingStatus, Transition,
};

use crate::ingest::{IncomingSignal, SignalPayload};
use crate::reconciler::{Outcome, Reconciler};

/// Parses the id carried in a pixel or click URL into an engagement signal.
pub fn engagement_signal(raw_id: &str, method: DetectionMethod) -> Result<IncomingSignal> {
    let trimmed = raw_id.trim().trim_end_matches(".gif");
    let tracked_id = Uuid::parse_str(trimmed)
        .map_err(|_| TrackerError::MalformedSignal(format!("invalid tracking id '{}'", raw_id)))?;
    Ok(IncomingSignal::engagement(tracked_id, method))
}

fn event_type(method: DetectionMethod) -> &'static str {
    match method {
        DetectionMethod::LinkClick => "link.click",
        _ => "pixel.open",
    }
}

/// Logs the engagement and, when configured, treats it as a reply.
/// Returns the reconciler outcome if a status change was attempted.
pub async fn record_engagement(ctx: &TrackerContext, signal: &IncomingSignal) -> Result<Option<Outcome>> {
    let (tracked_id, method) = match &signal.payload {
        SignalPayload::Engagement { tracked_id, method } => (*tracked_id, *method),
        SignalPayload::Messages(_) => {
            return Err(TrackerError::MalformedSignal(
                "message payload on engagement path".to_string(),
            ))
        }
    };

    let tracked = ctx
        .store
        .get_tracked(tracked_id)
        .await?
        .ok_or_else(|| TrackerError::NotFound(format!("tracked message {}", tracked_id)))?;

    let event = TrackingEvent::new(
        event_type(method),
        json!({"status_before": tracked.status.as_str()}),
    )
    .for_tracked(tracked.id)
    .for_user(&tracked.user_id);
    ctx.store.append_event(event).await?;

    if !ctx.config.tracking.pixel_marks_replied || tracked.status != TrackingStatus::Pending {
        return Ok(None);
    }

    let reconciler = Reconciler::new(ctx.store.clone());
    let outcome = reconciler
        .apply(
            tracked.id,
            Transition::Replied {
                at: signal.received_at,
                method,
            },
        )
        .await?;
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracker_core::testing::{new_tracked, test_config, test_context, FakeProvider};
    use tracker_core::{MemoryStore, StoreTokenSource, TrackingStore};

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(matches!(
            engagement_signal("not-a-uuid", DetectionMethod::PixelOpen),
            Err(TrackerError::MalformedSignal(_))
        ));
        let id = Uuid::new_v4();
        let signal = engagement_signal(&format!("{}.gif", id), DetectionMethod::PixelOpen).unwrap();
        assert!(matches!(signal.payload, SignalPayload::Engagement { tracked_id, .. } if tracked_id == id));
    }

    #[tokio::test]
    async fn pixel_open_flips_pending_to_replied() {
        let store = Arc::new(MemoryStore::new());
        let ctx = test_context(store.clone(), Arc::new(FakeProvider::new()));
        let tracked = store
            .insert_tracked(new_tracked("user-1", "me@example.com", "lead@example.com", "Hi"))
            .await
            .unwrap();

        let signal = engagement_signal(&tracked.id.to_string(), DetectionMethod::PixelOpen).unwrap();
        assert_eq!(record_engagement(&ctx, &signal).await.unwrap(), Some(Outcome::Applied));
        assert_eq!(record_engagement(&ctx, &signal).await.unwrap(), None);

        let stored = store.get_tracked(tracked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Replied);
        assert_eq!(stored.reply_method, Some(DetectionMethod::PixelOpen));
        let opens = store
            .events()
            .await
            .into_iter()
            .filter(|e| e.event_type == "pixel.open")
            .count();
        assert_eq!(opens, 2);
    }

    #[tokio::test]
    async fn engagement_only_logs_when_flip_disabled() {
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.tracking.pixel_marks_replied = false;
        let ctx = TrackerContext::from_parts(
            config,
            store.clone(),
            Arc::new(FakeProvider::new()),
            Arc::new(StoreTokenSource::new(store.clone())),
        );
        let tracked = store
            .insert_tracked(new_tracked("user-1", "me@example.com", "lead@example.com", "Hi"))
            .await
            .unwrap();

        let signal = engagement_signal(&tracked.id.to_string(), DetectionMethod::LinkClick).unwrap();
        assert_eq!(record_engagement(&ctx, &signal).await.unwrap(), None);

        let stored = store.get_tracked(tracked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Pending);
        assert!(store.events().await.iter().any(|e| e.event_type == "link.click"));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let ctx = test_context(store, Arc::new(FakeProvider::new()));
        let signal = engagement_signal(&Uuid::new_v4().to_string(), DetectionMethod::PixelOpen).unwrap();
        assert!(matches!(
            record_engagement(&ctx, &signal).await,
            Err(TrackerError::NotFound(_))
        ));
    }
}
