//! In-process fakes for exercising the tracking core without Postgres or Graph.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::context::TrackerContext;
use crate::error::{Result, TrackerError};
use crate::provider::{
    AccessToken, EmailAddress, Folder, Lookup, MailProvider, MessageHeader, ProviderMessage,
    ProviderSubscription, Recipient, SubscriptionRequest,
};
use crate::store::{MemoryStore, MessageIds, TrackingStore};
use crate::token::StoreTokenSource;
use crate::types::{
    IncomingMessageRecord, NewTrackedMessage, StoredToken, Subscription, SubscriptionStatus,
    TrackedMessage, TrackingEvent, Transition,
};

pub const CLIENT_STATE: &str = "test-client-state";

#[derive(Default)]
struct FakeState {
    subscriptions: HashMap<String, ProviderSubscription>,
    messages: HashMap<String, ProviderMessage>,
    inbox: Vec<ProviderMessage>,
    sent: Vec<ProviderMessage>,
    rejected_renewals: HashSet<String>,
    failing_users: HashMap<String, TrackerError>,
    created: Vec<SubscriptionRequest>,
    renew_calls: usize,
    next_id: u64,
    message_delay: Option<std::time::Duration>,
}

/// Scriptable mail provider.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_subscription(&self, id: &str, expires_at: DateTime<Utc>) {
        self.state().subscriptions.insert(
            id.to_string(),
            ProviderSubscription {
                id: id.to_string(),
                resource: "me/messages".to_string(),
                expires_at,
            },
        );
    }

    pub fn forget_subscription(&self, id: &str) {
        self.state().subscriptions.remove(id);
    }

    pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
        self.state().subscriptions.get(id).cloned()
    }

    pub fn reject_renewal(&self, id: &str) {
        self.state().rejected_renewals.insert(id.to_string());
    }

    pub fn fail_user(&self, user_id: &str, error: TrackerError) {
        self.state().failing_users.insert(user_id.to_string(), error);
    }

    /// Makes a message fetchable by id, as a push notification would reference it.
    pub fn add_message(&self, message: ProviderMessage) {
        let id = message.id.clone().unwrap_or_default();
        self.state().messages.insert(id, message);
    }

    /// Makes every message fetch take `delay`.
    pub fn delay_messages(&self, delay: std::time::Duration) {
        self.state().message_delay = Some(delay);
    }

    pub fn add_inbox(&self, message: ProviderMessage) {
        self.add_message(message.clone());
        self.state().inbox.push(message);
    }

    pub fn add_sent(&self, message: ProviderMessage) {
        self.add_message(message.clone());
        self.state().sent.push(message);
    }

    pub fn created_requests(&self) -> Vec<SubscriptionRequest> {
        self.state().created.clone()
    }

    pub fn renew_calls(&self) -> usize {
        self.state().renew_calls
    }

    fn check_user(&self, token: &AccessToken) -> Result<()> {
        match self.state().failing_users.get(&token.user_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn create_subscription(
        &self,
        token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        self.check_user(token)?;
        let mut state = self.state();
        state.next_id += 1;
        let sub = ProviderSubscription {
            id: format!("sub-{}", state.next_id),
            resource: request.resource.clone(),
            expires_at: request.expires_at,
        };
        state.subscriptions.insert(sub.id.clone(), sub.clone());
        state.created.push(request.clone());
        Ok(sub)
    }

    async fn renew_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Lookup<ProviderSubscription>> {
        self.check_user(token)?;
        let mut state = self.state();
        state.renew_calls += 1;
        if state.rejected_renewals.contains(subscription_id) {
            return Err(TrackerError::ProviderRejected(format!(
                "renewal of {} refused",
                subscription_id
            )));
        }
        match state.subscriptions.get_mut(subscription_id) {
            Some(sub) => {
                sub.expires_at = expires_at;
                Ok(Lookup::Found(sub.clone()))
            }
            None => Ok(Lookup::NotFound),
        }
    }

    async fn list_subscriptions(&self, token: &AccessToken) -> Result<Vec<ProviderSubscription>> {
        self.check_user(token)?;
        Ok(self.state().subscriptions.values().cloned().collect())
    }

    async fn delete_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
    ) -> Result<Lookup<()>> {
        self.check_user(token)?;
        Ok(match self.state().subscriptions.remove(subscription_id) {
            Some(_) => Lookup::Found(()),
            None => Lookup::NotFound,
        })
    }

    async fn get_message(
        &self,
        token: &AccessToken,
        resource: &str,
    ) -> Result<Lookup<ProviderMessage>> {
        self.check_user(token)?;
        let delay = self.state().message_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let id = resource.rsplit('/').next().unwrap_or(resource);
        Ok(match self.state().messages.get(id) {
            Some(message) => Lookup::Found(message.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn list_messages(
        &self,
        token: &AccessToken,
        folder: Folder,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderMessage>> {
        self.check_user(token)?;
        let state = self.state();
        let messages = match folder {
            Folder::Inbox => &state.inbox,
            Folder::SentItems => &state.sent,
        };
        Ok(messages
            .iter()
            .filter(|m| {
                let stamp = match folder {
                    Folder::Inbox => m.received_date_time,
                    Folder::SentItems => m.sent_date_time,
                };
                stamp.map_or(false, |ts| ts >= since)
            })
            .cloned()
            .collect())
    }
}

/// Wraps [`MemoryStore`] and fails on demand: globally, per tracked message,
/// or on incoming-message writes.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    unavailable: AtomicBool,
    failing_incoming: AtomicBool,
    failing_tracked: Mutex<HashSet<Uuid>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails only writes of incoming messages.
    pub fn fail_incoming_inserts(&self, failing: bool) {
        self.failing_incoming.store(failing, Ordering::SeqCst);
    }

    pub fn fail_tracked(&self, id: Uuid) {
        self.failing_tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TrackerError::Store("database unavailable".into()));
        }
        Ok(())
    }

    fn check_tracked(&self, id: Uuid) -> Result<()> {
        self.check()?;
        let failing = self
            .failing_tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&id);
        if failing {
            return Err(TrackerError::Store(format!("injected failure for {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl TrackingStore for FaultyStore {
    async fn insert_tracked(&self, new: NewTrackedMessage) -> Result<TrackedMessage> {
        self.check()?;
        self.inner.insert_tracked(new).await
    }

    async fn get_tracked(&self, id: Uuid) -> Result<Option<TrackedMessage>> {
        self.check_tracked(id)?;
        self.inner.get_tracked(id).await
    }

    async fn list_pending(&self, sent_after: DateTime<Utc>) -> Result<Vec<TrackedMessage>> {
        self.check()?;
        self.inner.list_pending(sent_after).await
    }

    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<TrackedMessage>> {
        self.check()?;
        self.inner.pending_for_user(user_id).await
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.check()?;
        self.inner.list_overdue(now).await
    }

    async fn fill_message_ids(&self, id: Uuid, ids: &MessageIds) -> Result<()> {
        self.check_tracked(id)?;
        self.inner.fill_message_ids(id, ids).await
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<bool> {
        self.check_tracked(id)?;
        self.inner.transition(id, transition).await
    }

    async fn insert_incoming(&self, record: &IncomingMessageRecord) -> Result<bool> {
        self.check()?;
        if self.failing_incoming.load(Ordering::SeqCst) {
            return Err(TrackerError::Store(format!(
                "injected failure for incoming {}",
                record.provider_message_id
            )));
        }
        self.inner.insert_incoming(record).await
    }

    async fn known_incoming_ids(&self, user_id: &str, ids: &[String]) -> Result<HashSet<String>> {
        self.check()?;
        self.inner.known_incoming_ids(user_id, ids).await
    }

    async fn incoming_in_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>> {
        self.check()?;
        self.inner.incoming_in_conversation(user_id, conversation_id, after).await
    }

    async fn incoming_replying_to(
        &self,
        user_id: &str,
        internet_message_id: &str,
    ) -> Result<Vec<IncomingMessageRecord>> {
        self.check()?;
        self.inner.incoming_replying_to(user_id, internet_message_id).await
    }

    async fn incoming_from_sender(
        &self,
        user_id: &str,
        sender_address: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>> {
        self.check()?;
        self.inner.incoming_from_sender(user_id, sender_address, after).await
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.check()?;
        self.inner.insert_subscription(subscription).await
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        self.check()?;
        self.inner.get_subscription(subscription_id).await
    }

    async fn list_subscriptions(&self, user_id: Option<&str>) -> Result<Vec<Subscription>> {
        self.check()?;
        self.inner.list_subscriptions(user_id).await
    }

    async fn active_subscription_for(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Subscription>> {
        self.check()?;
        self.inner.active_subscription_for(user_id, resource).await
    }

    async fn active_subscriptions_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        self.check()?;
        self.inner.active_subscriptions_expiring_before(before).await
    }

    async fn extend_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check()?;
        self.inner.extend_subscription(subscription_id, expires_at).await
    }

    async fn set_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<bool> {
        self.check()?;
        self.inner.set_subscription_status(subscription_id, status).await
    }

    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> Result<i64> {
        self.check()?;
        self.inner.count_active_subscriptions(now).await
    }

    async fn stored_token(&self, user_id: &str) -> Result<Option<StoredToken>> {
        self.check()?;
        self.inner.stored_token(user_id).await
    }

    async fn append_event(&self, event: TrackingEvent) -> Result<()> {
        self.check()?;
        self.inner.append_event(event).await
    }
}

/// Config with the push prerequisites filled in.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.public_base_url = Some("https://tracker.example.com".to_string());
    config.server.cron_secret = Some("cron-secret".to_string());
    config.provider.client_id = Some("client-id".to_string());
    config.provider.client_state = Some(CLIENT_STATE.to_string());
    config
}

pub fn test_context(store: Arc<dyn TrackingStore>, provider: Arc<FakeProvider>) -> TrackerContext {
    let tokens = Arc::new(StoreTokenSource::new(store.clone()));
    TrackerContext::from_parts(test_config(), store, provider, tokens)
}

pub fn valid_token(user_id: &str, email: &str) -> StoredToken {
    StoredToken {
        user_id: user_id.to_string(),
        email: email.to_string(),
        access_token: format!("token-{}", user_id),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

pub fn new_tracked(user_id: &str, sender: &str, recipient: &str, subject: &str) -> NewTrackedMessage {
    NewTrackedMessage {
        user_id: user_id.to_string(),
        sender_address: sender.to_string(),
        recipient_address: recipient.to_string(),
        subject: subject.to_string(),
        provider_message_id: None,
        conversation_id: None,
        internet_message_id: None,
        sent_at: Utc::now() - Duration::hours(2),
        expires_at: None,
    }
}

pub fn incoming(
    user_id: &str,
    provider_message_id: &str,
    sender: &str,
    subject: &str,
    received_at: DateTime<Utc>,
) -> IncomingMessageRecord {
    IncomingMessageRecord {
        user_id: user_id.to_string(),
        provider_message_id: provider_message_id.to_string(),
        conversation_id: None,
        internet_message_id: None,
        in_reply_to: None,
        sender_address: sender.to_string(),
        recipient_address: "me@example.com".to_string(),
        subject: subject.to_string(),
        received_at,
        body_preview: String::new(),
        is_read: false,
    }
}

fn recipient(address: &str) -> Recipient {
    Recipient {
        email_address: EmailAddress {
            name: None,
            address: Some(address.to_string()),
        },
    }
}

/// A provider-shaped message as Graph would return it.
pub fn provider_message(
    id: &str,
    conversation_id: &str,
    from: &str,
    to: &str,
    subject: &str,
    at: DateTime<Utc>,
) -> ProviderMessage {
    ProviderMessage {
        id: Some(id.to_string()),
        conversation_id: Some(conversation_id.to_string()),
        internet_message_id: Some(format!("<{}@mail.example.com>", id)),
        subject: Some(subject.to_string()),
        body_preview: Some("preview".to_string()),
        is_read: Some(false),
        received_date_time: Some(at),
        sent_date_time: Some(at),
        from: Some(recipient(from)),
        to_recipients: vec![recipient(to)],
        internet_message_headers: Vec::<MessageHeader>::new(),
    }
}
