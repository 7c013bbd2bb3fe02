use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{MessageIds, TrackingStore};
use crate::error::{Result, TrackerError};
use crate::types::{
    IncomingMessageRecord, NewTrackedMessage, StoredToken, Subscription, SubscriptionStatus,
    TrackedMessage, TrackingEvent, TrackingStatus, Transition,
};

#[derive(Default)]
struct State {
    tracked: HashMap<Uuid, TrackedMessage>,
    incoming: Vec<IncomingMessageRecord>,
    subscriptions: HashMap<String, Subscription>,
    tokens: HashMap<String, StoredToken>,
    events: Vec<TrackingEvent>,
}

/// Single-process store with the same conditional-write semantics as Postgres.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_token(&self, token: StoredToken) {
        let mut state = self.state.lock().await;
        state.tokens.insert(token.user_id.clone(), token);
    }

    pub async fn events(&self) -> Vec<TrackingEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn incoming_count(&self) -> usize {
        self.state.lock().await.incoming.len()
    }
}

fn earliest_first(mut records: Vec<IncomingMessageRecord>) -> Vec<IncomingMessageRecord> {
    records.sort_by_key(|r| r.received_at);
    records
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn insert_tracked(&self, new: NewTrackedMessage) -> Result<TrackedMessage> {
        let message = TrackedMessage {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            sender_address: new.sender_address,
            recipient_address: new.recipient_address,
            subject: new.subject,
            provider_message_id: new.provider_message_id,
            conversation_id: new.conversation_id,
            internet_message_id: new.internet_message_id,
            sent_at: new.sent_at,
            expires_at: new.expires_at,
            status: TrackingStatus::Pending,
            reply_received_at: None,
            reply_method: None,
            stopped_at: None,
        };
        let mut state = self.state.lock().await;
        state.tracked.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_tracked(&self, id: Uuid) -> Result<Option<TrackedMessage>> {
        Ok(self.state.lock().await.tracked.get(&id).cloned())
    }

    async fn list_pending(&self, sent_after: DateTime<Utc>) -> Result<Vec<TrackedMessage>> {
        let state = self.state.lock().await;
        let mut pending: Vec<TrackedMessage> = state
            .tracked
            .values()
            .filter(|m| m.status == TrackingStatus::Pending && m.sent_at >= sent_after)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.sent_at);
        Ok(pending)
    }

    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<TrackedMessage>> {
        let state = self.state.lock().await;
        let mut pending: Vec<TrackedMessage> = state
            .tracked
            .values()
            .filter(|m| m.status == TrackingStatus::Pending && m.user_id == user_id)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.sent_at);
        Ok(pending)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .tracked
            .values()
            .filter(|m| m.is_overdue(now))
            .map(|m| m.id)
            .collect())
    }

    async fn fill_message_ids(&self, id: Uuid, ids: &MessageIds) -> Result<()> {
        let mut state = self.state.lock().await;
        let message = state
            .tracked
            .get_mut(&id)
            .ok_or_else(|| TrackerError::NotFound(format!("tracked message {}", id)))?;

        if let (Some(stored), Some(incoming)) = (&message.conversation_id, &ids.conversation_id) {
            if stored != incoming {
                return Err(TrackerError::ConversationConflict {
                    tracked_id: id.to_string(),
                    stored: stored.clone(),
                    incoming: incoming.clone(),
                });
            }
        }

        if message.conversation_id.is_none() {
            message.conversation_id = ids.conversation_id.clone();
        }
        if message.internet_message_id.is_none() {
            message.internet_message_id = ids.internet_message_id.clone();
        }
        if message.provider_message_id.is_none() {
            message.provider_message_id = ids.provider_message_id.clone();
        }
        Ok(())
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<bool> {
        let mut state = self.state.lock().await;
        let message = match state.tracked.get_mut(&id) {
            Some(m) => m,
            None => return Ok(false),
        };
        if message.status != TrackingStatus::Pending {
            return Ok(false);
        }

        message.status = transition.target();
        match transition {
            Transition::Replied { at, method } => {
                message.reply_received_at = Some(at);
                message.reply_method = Some(method);
            }
            Transition::Stopped { at } => message.stopped_at = Some(at),
            Transition::Expired => {}
        }
        Ok(true)
    }

    async fn insert_incoming(&self, record: &IncomingMessageRecord) -> Result<bool> {
        let mut state = self.state.lock().await;
        let exists = state.incoming.iter().any(|r| {
            r.user_id == record.user_id && r.provider_message_id == record.provider_message_id
        });
        if exists {
            return Ok(false);
        }
        state.incoming.push(record.clone());
        Ok(true)
    }

    async fn known_incoming_ids(&self, user_id: &str, ids: &[String]) -> Result<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .incoming
            .iter()
            .filter(|r| r.user_id == user_id && ids.contains(&r.provider_message_id))
            .map(|r| r.provider_message_id.clone())
            .collect())
    }

    async fn incoming_in_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>> {
        let state = self.state.lock().await;
        Ok(earliest_first(
            state
                .incoming
                .iter()
                .filter(|r| {
                    r.user_id == user_id
                        && r.conversation_id.as_deref() == Some(conversation_id)
                        && r.received_at > after
                })
                .cloned()
                .collect(),
        ))
    }

    async fn incoming_replying_to(
        &self,
        user_id: &str,
        internet_message_id: &str,
    ) -> Result<Vec<IncomingMessageRecord>> {
        let state = self.state.lock().await;
        Ok(earliest_first(
            state
                .incoming
                .iter()
                .filter(|r| {
                    r.user_id == user_id && r.in_reply_to.as_deref() == Some(internet_message_id)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn incoming_from_sender(
        &self,
        user_id: &str,
        sender_address: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>> {
        let state = self.state.lock().await;
        Ok(earliest_first(
            state
                .incoming
                .iter()
                .filter(|r| {
                    r.user_id == user_id && r.sender_address == sender_address && r.received_at > after
                })
                .cloned()
                .collect(),
        ))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(subscription_id).cloned())
    }

    async fn list_subscriptions(&self, user_id: Option<&str>) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| user_id.map_or(true, |u| s.user_id == u))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn active_subscription_for(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| {
                s.user_id == user_id && s.resource == resource && s.status == SubscriptionStatus::Active
            })
            .max_by_key(|s| s.expires_at)
            .cloned())
    }

    async fn active_subscriptions_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.expires_at <= before)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.expires_at);
        Ok(subs)
    }

    async fn extend_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(subscription_id) {
            Some(sub) if sub.expires_at < expires_at => {
                sub.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.subscriptions.get_mut(subscription_id) {
            Some(sub) if sub.status != status && sub.status != SubscriptionStatus::Deleted => {
                sub.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.expires_at > now)
            .count() as i64)
    }

    async fn stored_token(&self, user_id: &str) -> Result<Option<StoredToken>> {
        Ok(self.state.lock().await.tokens.get(user_id).cloned())
    }

    async fn append_event(&self, event: TrackingEvent) -> Result<()> {
        self.state.lock().await.events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionMethod;
    use chrono::Duration;

    fn new_message(conversation_id: Option<&str>) -> NewTrackedMessage {
        NewTrackedMessage {
            user_id: "user-1".into(),
            sender_address: "me@example.com".into(),
            recipient_address: "lead@example.com".into(),
            subject: "Quick question".into(),
            provider_message_id: None,
            conversation_id: conversation_id.map(str::to_string),
            internet_message_id: None,
            sent_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn transition_applies_only_once() {
        let store = MemoryStore::new();
        let msg = store.insert_tracked(new_message(None)).await.unwrap();
        let replied = Transition::Replied {
            at: Utc::now(),
            method: DetectionMethod::ConversationId,
        };

        assert!(store.transition(msg.id, replied).await.unwrap());
        assert!(!store.transition(msg.id, replied).await.unwrap());
        assert!(!store
            .transition(msg.id, Transition::Stopped { at: Utc::now() })
            .await
            .unwrap());

        let stored = store.get_tracked(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Replied);
        assert_eq!(stored.reply_method, Some(DetectionMethod::ConversationId));
        assert!(stored.stopped_at.is_none());
    }

    #[tokio::test]
    async fn conversation_id_is_never_overwritten() {
        let store = MemoryStore::new();
        let msg = store.insert_tracked(new_message(Some("conv-a"))).await.unwrap();

        let same = MessageIds {
            conversation_id: Some("conv-a".into()),
            internet_message_id: Some("<a@mail>".into()),
            ..Default::default()
        };
        store.fill_message_ids(msg.id, &same).await.unwrap();

        let other = MessageIds {
            conversation_id: Some("conv-b".into()),
            ..Default::default()
        };
        let err = store.fill_message_ids(msg.id, &other).await.unwrap_err();
        assert!(matches!(err, TrackerError::ConversationConflict { .. }));

        let stored = store.get_tracked(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.conversation_id.as_deref(), Some("conv-a"));
        assert_eq!(stored.internet_message_id.as_deref(), Some("<a@mail>"));
    }

    #[tokio::test]
    async fn subscription_expiry_only_moves_forward() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_subscription(&Subscription {
                subscription_id: "sub-1".into(),
                user_id: "user-1".into(),
                resource: "me/messages".into(),
                change_types: "created".into(),
                expires_at: now + Duration::hours(2),
                status: SubscriptionStatus::Active,
                created_at: now,
            })
            .await
            .unwrap();

        assert!(store.extend_subscription("sub-1", now + Duration::hours(48)).await.unwrap());
        assert!(!store.extend_subscription("sub-1", now + Duration::hours(24)).await.unwrap());

        let sub = store.get_subscription("sub-1").await.unwrap().unwrap();
        assert_eq!(sub.expires_at, now + Duration::hours(48));
    }

    #[tokio::test]
    async fn deleted_subscription_stays_deleted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_subscription(&Subscription {
                subscription_id: "sub-1".into(),
                user_id: "user-1".into(),
                resource: "me/messages".into(),
                change_types: "created".into(),
                expires_at: now + Duration::hours(2),
                status: SubscriptionStatus::Active,
                created_at: now,
            })
            .await
            .unwrap();

        assert!(store.set_subscription_status("sub-1", SubscriptionStatus::Deleted).await.unwrap());
        assert!(!store.set_subscription_status("sub-1", SubscriptionStatus::Expired).await.unwrap());
        assert!(!store.set_subscription_status("sub-1", SubscriptionStatus::Active).await.unwrap());

        let sub = store.get_subscription("sub-1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Deleted);
    }
}
