//! The only writer of tracked-message status.
//!
//! Every move away from `pending` goes through [`TrackingStore::transition`],
//! a conditional write, so concurrent signals for the same message produce at
//! most one effective change. A losing caller gets [`Outcome::AlreadyFinal`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use tracker_core::{
    DetectionMethod, IncomingMessageRecord, Result, TrackedMessage, TrackerError, TrackingEvent,
    TrackingStatus, TrackingStore, Transition,
};

use crate::detector::{detect_reply, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This call moved the message out of `pending`.
    Applied,
    /// The message had already left `pending`; nothing changed.
    AlreadyFinal(TrackingStatus),
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub expired: usize,
    /// Overdue messages whose reply had arrived before the deadline.
    pub replied: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TrackingStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, id: Uuid, transition: Transition) -> Result<Outcome> {
        if self.store.transition(id, transition).await? {
            tracing::info!("Tracked message {} moved to {}", id, transition.target());
            self.audit(id, transition).await;
            return Ok(Outcome::Applied);
        }

        Ok(match self.store.get_tracked(id).await? {
            Some(current) => {
                tracing::debug!(
                    "Skipping {} for {}: already {}",
                    transition.target(),
                    id,
                    current.status
                );
                Outcome::AlreadyFinal(current.status)
            }
            None => Outcome::NotFound,
        })
    }

    /// Marks a reply, stamped with the matched record's receipt time.
    pub async fn record_reply(
        &self,
        tracked: &TrackedMessage,
        method: DetectionMethod,
        record: &IncomingMessageRecord,
    ) -> Result<Outcome> {
        self.apply(
            tracked.id,
            Transition::Replied {
                at: record.received_at,
                method,
            },
        )
        .await
    }

    pub async fn stop(&self, id: Uuid) -> Result<Outcome> {
        self.apply(id, Transition::Stopped { at: Utc::now() }).await
    }

    /// What an overdue message settles to: a stored reply received at or
    /// before the deadline wins over expiry, however late it is found.
    async fn overdue_transition(&self, tracked: &TrackedMessage) -> Result<Transition> {
        if let Verdict::Reply { method, record } = detect_reply(self.store.as_ref(), tracked).await? {
            let in_time = tracked
                .expires_at
                .map_or(true, |deadline| record.received_at <= deadline);
            if in_time {
                return Ok(Transition::Replied {
                    at: record.received_at,
                    method,
                });
            }
        }
        Ok(Transition::Expired)
    }

    /// Settles every overdue message, as [`Reconciler::settle`] does.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        let overdue = self.store.list_overdue(now).await?;
        let mut report = ExpiryReport::default();

        for id in overdue {
            match self.settle(id, now).await {
                Ok(Some(TrackingStatus::Expired)) => report.expired += 1,
                Ok(Some(_)) => report.replied += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Failed to settle overdue tracked message {}: {}", id, e);
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }

        if report.expired > 0 || report.replied > 0 {
            tracing::info!(
                "Settled overdue tracked messages: expired={}, replied={}",
                report.expired,
                report.replied
            );
        }
        Ok(report)
    }

    /// Settles `id` if it is still pending past its deadline. Returns the
    /// status this call moved it to, if any.
    pub async fn settle(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<TrackingStatus>> {
        let tracked = match self.store.get_tracked(id).await? {
            Some(tracked) if tracked.is_overdue(now) => tracked,
            _ => return Ok(None),
        };
        let transition = self.overdue_transition(&tracked).await?;
        Ok(match self.apply(id, transition).await? {
            Outcome::Applied => Some(transition.target()),
            _ => None,
        })
    }

    async fn audit(&self, id: Uuid, transition: Transition) {
        let detail = match transition {
            Transition::Replied { at, method } => json!({
                "status": "replied",
                "method": method.as_str(),
                "high_confidence": method.is_high_confidence(),
                "reply_received_at": at,
            }),
            Transition::Stopped { at } => json!({"status": "stopped", "stopped_at": at}),
            Transition::Expired => json!({"status": "expired"}),
        };
        let event = TrackingEvent::new("status.changed", detail).for_tracked(id);
        if let Err(e) = self.store.append_event(event).await {
            tracing::warn!("Failed to audit status change of {}: {}", id, e);
        }
    }
}
