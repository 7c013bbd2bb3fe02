//! Persistence seam for the tracking core.
//!
//! The store is the only coordination point between concurrent handlers, so every
//! mutation that guards an invariant is expressed as a conditional write:
//! status moves only away from `pending`, conversation ids are only filled when
//! empty, and subscription expiries only move forward.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    IncomingMessageRecord, NewTrackedMessage, StoredToken, Subscription, SubscriptionStatus,
    TrackedMessage, TrackingEvent, Transition,
};

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Provider identifiers discovered for a tracked message after it was sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageIds {
    pub provider_message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub internet_message_id: Option<String>,
}

impl MessageIds {
    pub fn is_empty(&self) -> bool {
        self.provider_message_id.is_none()
            && self.conversation_id.is_none()
            && self.internet_message_id.is_none()
    }
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn insert_tracked(&self, new: NewTrackedMessage) -> Result<TrackedMessage>;

    async fn get_tracked(&self, id: Uuid) -> Result<Option<TrackedMessage>>;

    /// Pending messages sent at or after `sent_after`, oldest first.
    async fn list_pending(&self, sent_after: DateTime<Utc>) -> Result<Vec<TrackedMessage>>;

    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<TrackedMessage>>;

    /// Ids of pending messages whose expiry is at or before `now`.
    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Fills identifiers that are still empty. A different, already-stored
    /// conversation id yields `ConversationConflict`.
    async fn fill_message_ids(&self, id: Uuid, ids: &MessageIds) -> Result<()>;

    /// Applies `transition` only if the message is still pending.
    /// Returns whether this call performed the transition.
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<bool>;

    /// Inserts unless `(user_id, provider_message_id)` already exists.
    /// Returns whether a new row was written.
    async fn insert_incoming(&self, record: &IncomingMessageRecord) -> Result<bool>;

    async fn known_incoming_ids(&self, user_id: &str, ids: &[String]) -> Result<HashSet<String>>;

    /// Messages in `conversation_id` received strictly after `after`, earliest first.
    async fn incoming_in_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>>;

    /// Messages whose in-reply-to header names `internet_message_id`, earliest first.
    async fn incoming_replying_to(
        &self,
        user_id: &str,
        internet_message_id: &str,
    ) -> Result<Vec<IncomingMessageRecord>>;

    /// Messages from `sender_address` received strictly after `after`, earliest first.
    async fn incoming_from_sender(
        &self,
        user_id: &str,
        sender_address: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>>;

    async fn list_subscriptions(&self, user_id: Option<&str>) -> Result<Vec<Subscription>>;

    async fn active_subscription_for(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Subscription>>;

    async fn active_subscriptions_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Subscription>>;

    /// Moves the expiry forward; an earlier or equal `expires_at` is ignored.
    /// Returns whether the stored expiry changed.
    async fn extend_subscription(&self, subscription_id: &str, expires_at: DateTime<Utc>)
        -> Result<bool>;

    /// Returns whether the status changed. `deleted` is final and never left.
    async fn set_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<bool>;

    /// Active subscriptions whose expiry is still in the future.
    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> Result<i64>;

    async fn stored_token(&self, user_id: &str) -> Result<Option<StoredToken>>;

    async fn append_event(&self, event: TrackingEvent) -> Result<()>;
}
