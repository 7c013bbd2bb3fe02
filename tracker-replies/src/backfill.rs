use chrono::Duration;

use tracker_core::provider::ProviderMessage;
use tracker_core::types::normalize_address;
use tracker_core::{MessageIds, TrackedMessage, TrackingStore};

/// How far a sent copy's timestamp may drift from the recorded send time.
const SEND_TIME_TOLERANCE_MINUTES: i64 = 10;

fn same_id(known: &Option<String>, candidate: &Option<String>) -> bool {
    matches!((known, candidate), (Some(a), Some(b)) if a == b)
}

fn is_sent_copy(tracked: &TrackedMessage, message: &ProviderMessage) -> bool {
    if same_id(&tracked.provider_message_id, &message.id)
        || same_id(&tracked.internet_message_id, &message.internet_message_id)
    {
        return true;
    }

    let recipient_matches = message
        .first_recipient()
        .map_or(false, |r| normalize_address(r) == normalize_address(&tracked.recipient_address));
    let subject_matches = message
        .subject
        .as_deref()
        .map_or(false, |s| s.trim().eq_ignore_ascii_case(tracked.subject.trim()));
    let sent_close = message.sent_date_time.map_or(false, |sent| {
        (sent - tracked.sent_at).num_seconds().abs() <= Duration::minutes(SEND_TIME_TOLERANCE_MINUTES).num_seconds()
    });

    recipient_matches && subject_matches && sent_close
}

/// Fills missing provider identifiers of `pending` messages from the user's
/// own sent copies. Returns how many tracked messages gained an identifier.
pub async fn backfill_message_ids(
    store: &dyn TrackingStore,
    pending: &[TrackedMessage],
    sent: &[ProviderMessage],
) -> usize {
    let mut filled = 0;

    for tracked in pending.iter().filter(|t| t.conversation_id.is_none()) {
        let Some(copy) = sent.iter().find(|m| is_sent_copy(tracked, m)) else {
            continue;
        };
        let ids = MessageIds {
            provider_message_id: copy.id.clone().filter(|_| tracked.provider_message_id.is_none()),
            conversation_id: copy.conversation_id.clone().filter(|c| !c.is_empty()),
            internet_message_id: copy
                .internet_message_id
                .clone()
                .filter(|_| tracked.internet_message_id.is_none()),
        };
        if ids.is_empty() {
            continue;
        }

        match store.fill_message_ids(tracked.id, &ids).await {
            Ok(()) => {
                tracing::debug!(
                    "Backfilled conversation {:?} for tracked message {}",
                    ids.conversation_id,
                    tracked.id
                );
                filled += 1;
            }
            Err(e) => tracing::error!("Failed to backfill ids for {}: {}", tracked.id, e),
        }
    }

    filled
}
