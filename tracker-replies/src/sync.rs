use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

use tracker_core::provider::Folder;
use tracker_core::{Result, TrackedMessage, TrackerContext, TrackerError, TrackingEvent, TrackingStatus};

use crate::backfill::backfill_message_ids;
use crate::detector::{detect_reply, Verdict};
use crate::ingest::{ingest, IncomingSignal};
use crate::reconciler::{Outcome, Reconciler};

/// Tracked messages evaluated concurrently within one user's batch.
const DETECTION_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub updated: usize,
    pub errors: Vec<String>,
    /// Messages left alone because their owner has to reconnect.
    pub skipped: usize,
    pub paused_users: Vec<String>,
}

/// Pulls fresh mailbox activity for `user_id`: new inbox messages are
/// ingested (deduplicated by provider id) and sent copies backfill the
/// identifiers of `pending`. Returns the number of newly stored messages.
/// Messages the store could not take fail the refresh after the rest of it
/// has run.
pub async fn refresh_mailbox(
    ctx: &TrackerContext,
    user_id: &str,
    pending: &[TrackedMessage],
    window: MailboxWindow,
) -> Result<usize> {
    let token = ctx.tokens.access_token(user_id).await?;

    let inbox = ctx.provider.list_messages(&token, Folder::Inbox, window.inbox_since).await?;
    let ids: Vec<String> = inbox.iter().filter_map(|m| m.id.clone()).collect();
    let known = ctx.store.known_incoming_ids(user_id, &ids).await?;
    let unseen: Vec<_> = inbox
        .into_iter()
        .filter(|m| m.id.as_ref().map_or(false, |id| !known.contains(id)))
        .collect();
    let ingested = ingest(ctx.store.as_ref(), &IncomingSignal::poll(user_id, unseen)).await;

    if let Some(sent_since) = window.sent_since {
        let sent = ctx.provider.list_messages(&token, Folder::SentItems, sent_since).await?;
        backfill_message_ids(ctx.store.as_ref(), pending, &sent).await;
    }

    ingested.into_result().map(|fresh| fresh.len())
}

/// Re-reads one tracked message and records a reply if one is found. Past
/// its deadline the message is settled instead, so a reply that arrived in
/// time still wins over expiry. Returns whether this call marked it replied.
pub async fn resolve_tracked(ctx: &TrackerContext, reconciler: &Reconciler, id: Uuid) -> Result<bool> {
    let tracked = ctx
        .store
        .get_tracked(id)
        .await?
        .ok_or_else(|| TrackerError::NotFound(format!("tracked message {}", id)))?;
    if tracked.status != TrackingStatus::Pending {
        return Ok(false);
    }

    let now = Utc::now();
    if tracked.is_overdue(now) {
        return Ok(reconciler.settle(id, now).await? == Some(TrackingStatus::Replied));
    }

    match detect_reply(ctx.store.as_ref(), &tracked).await? {
        Verdict::Reply { method, record } => {
            let outcome = reconciler.record_reply(&tracked, method, &record).await?;
            Ok(outcome == Outcome::Applied)
        }
        Verdict::NoReply => Ok(false),
    }
}

/// How far back one mailbox refresh reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxWindow {
    pub inbox_since: DateTime<Utc>,
    /// Set while some pending message still lacks its conversation id; starts
    /// at the oldest such message so its sent copy can always be found.
    pub sent_since: Option<DateTime<Utc>>,
}

/// Inbox reads normally cover the lookback window, or less if every pending
/// message is younger. While a message still needs backfilling, both reads
/// reach back to it. `pending` is already bounded by the sweep's max age.
pub fn mailbox_window(lookback_hours: i64, pending: &[TrackedMessage], now: DateTime<Utc>) -> MailboxWindow {
    let slack = Duration::minutes(10);
    let lookback = now - Duration::hours(lookback_hours);
    let oldest = pending.iter().map(|t| t.sent_at).min().unwrap_or(now) - slack;
    let sent_since = pending
        .iter()
        .filter(|t| t.conversation_id.is_none())
        .map(|t| t.sent_at)
        .min()
        .map(|sent_at| sent_at - slack);

    let recent = lookback.max(oldest);
    MailboxWindow {
        inbox_since: sent_since.map_or(recent, |sent_since| recent.min(sent_since)),
        sent_since,
    }
}

/// Runs detection for every pending message sent within `max_age_days`.
/// Failures are isolated per message and per mailbox; the sweep itself only
/// fails when the pending set cannot be listed.
pub async fn sync_all_pending_replies(ctx: &TrackerContext, max_age_days: i64) -> Result<SyncReport> {
    sweep(ctx, max_age_days, None).await
}

/// The same sweep restricted to one user's pending messages.
pub async fn sync_user_pending_replies(
    ctx: &TrackerContext,
    user_id: &str,
    max_age_days: i64,
) -> Result<SyncReport> {
    sweep(ctx, max_age_days, Some(user_id)).await
}

async fn sweep(ctx: &TrackerContext, max_age_days: i64, only_user: Option<&str>) -> Result<SyncReport> {
    let now = Utc::now();
    let pending = ctx.store.list_pending(now - Duration::days(max_age_days)).await?;

    let mut by_user: BTreeMap<String, Vec<TrackedMessage>> = BTreeMap::new();
    for tracked in pending {
        if only_user.map_or(true, |user| user == tracked.user_id) {
            by_user.entry(tracked.user_id.clone()).or_default().push(tracked);
        }
    }

    let reconciler = Reconciler::new(ctx.store.clone());
    let mut report = SyncReport::default();

    for (user_id, items) in by_user {
        let window = mailbox_window(ctx.config.tracking.sync_lookback_hours, &items, now);
        match refresh_mailbox(ctx, &user_id, &items, window).await {
            Ok(stored) => {
                tracing::debug!("Stored {} new message(s) for {}", stored, user_id);
            }
            Err(TrackerError::AuthRequired { .. }) => {
                tracing::warn!(
                    "Pausing reply detection for {} ({} pending): reconnect required",
                    user_id,
                    items.len()
                );
                report.skipped += items.len();
                report.paused_users.push(user_id);
                continue;
            }
            Err(e) => {
                // Detection still runs against what earlier signals stored.
                tracing::error!("Mailbox refresh failed for {}: {}", user_id, e);
                report.errors.push(format!("mailbox {}: {}", user_id, e));
            }
        }

        let results: Vec<(Uuid, Result<bool>)> = stream::iter(items.iter().map(|t| t.id).collect::<Vec<Uuid>>())
            .map(|id| {
                let reconciler = &reconciler;
                async move { (id, resolve_tracked(ctx, reconciler, id).await) }
            })
            .buffer_unordered(DETECTION_CONCURRENCY)
            .collect()
            .await;

        for (id, result) in results {
            report.processed += 1;
            match result {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Reply sync failed for {}: {}", id, e);
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }
    }

    tracing::info!(
        "Reply sync finished: processed={}, updated={}, errors={}, paused_users={}",
        report.processed,
        report.updated,
        report.errors.len(),
        report.paused_users.len()
    );

    let event = TrackingEvent::new(
        "sync.completed",
        json!({
            "processed": report.processed,
            "updated": report.updated,
            "errors": report.errors.len(),
            "paused_users": report.paused_users,
            "user_id": only_user,
        }),
    );
    if let Err(e) = ctx.store.append_event(event).await {
        tracing::warn!("Failed to audit reply sync: {}", e);
    }

    Ok(report)
}
