//! Push subscriptions are leases: they expire, and the provider can drop them
//! without notice. Everything here assumes a subscription may be gone and
//! reports that instead of hiding it.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

use tracker_core::provider::SubscriptionRequest;
use tracker_core::{
    Lookup, Result, Subscription, SubscriptionStatus, TrackerContext, TrackerError, TrackingEvent,
};

const RENEWAL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalReport {
    pub renewed: usize,
    pub errors: usize,
    /// Subscriptions the provider no longer knew and that were created anew.
    pub recreated: usize,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Present,
    /// Known locally, absent at the provider. Left in place for the caller.
    Missing,
    /// The provider could not be asked.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub provider_state: ProviderState,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    ctx: TrackerContext,
}

impl SubscriptionManager {
    pub fn new(ctx: TrackerContext) -> Self {
        Self { ctx }
    }

    fn max_ttl(&self) -> Duration {
        Duration::minutes(self.ctx.config.provider.subscription_ttl_minutes)
    }

    fn renewal_window(&self) -> Duration {
        Duration::hours(self.ctx.config.tracking.renewal_window_hours)
    }

    async fn audit(&self, event: TrackingEvent) {
        if let Err(e) = self.ctx.store.append_event(event).await {
            tracing::warn!("Failed to audit subscription event: {}", e);
        }
    }

    /// Registers a push subscription for `user_id`, or returns the user's
    /// existing one for `resource` if it does not need renewal yet.
    /// `ttl` is capped at the provider maximum.
    pub async fn create(
        &self,
        user_id: &str,
        resource: &str,
        change_types: &str,
        ttl: Option<Duration>,
    ) -> Result<Subscription> {
        let notification_url = self
            .ctx
            .config
            .webhook_url()
            .ok_or_else(|| TrackerError::Config("PUBLIC_BASE_URL is not set".to_string()))?;
        let client_state = self
            .ctx
            .config
            .provider
            .client_state
            .clone()
            .ok_or_else(|| TrackerError::Config("WEBHOOK_CLIENT_STATE is not set".to_string()))?;

        let now = Utc::now();
        let existing = self.ctx.store.active_subscription_for(user_id, resource).await?;
        if let Some(existing) = &existing {
            if existing.expires_at > now + self.renewal_window() {
                tracing::debug!(
                    "Reusing subscription {} for {} on {}",
                    existing.subscription_id,
                    user_id,
                    resource
                );
                return Ok(existing.clone());
            }
        }

        let ttl = match ttl {
            Some(ttl) if ttl > Duration::zero() => ttl.min(self.max_ttl()),
            _ => self.max_ttl(),
        };
        let token = self.ctx.tokens.access_token(user_id).await?;
        let request = SubscriptionRequest {
            resource: resource.to_string(),
            change_types: change_types.to_string(),
            notification_url,
            client_state,
            expires_at: now + ttl,
        };
        let created = self.ctx.provider.create_subscription(&token, &request).await?;

        let subscription = Subscription {
            subscription_id: created.id,
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            change_types: change_types.to_string(),
            expires_at: created.expires_at,
            status: SubscriptionStatus::Active,
            created_at: now,
        };
        self.ctx.store.insert_subscription(&subscription).await?;
        tracing::info!(
            "Created subscription {} for {} (expires {})",
            subscription.subscription_id,
            user_id,
            subscription.expires_at
        );
        self.audit(
            TrackingEvent::new(
                "subscription.created",
                json!({"subscription_id": subscription.subscription_id, "resource": resource}),
            )
            .for_user(user_id),
        )
        .await;

        // The replaced lease is about to lapse anyway; retiring it is best-effort.
        if let Some(old) = existing {
            if let Err(e) = self.delete(&old.subscription_id).await {
                tracing::warn!("Failed to retire subscription {}: {}", old.subscription_id, e);
            }
        }

        Ok(subscription)
    }

    /// Extends a subscription to the provider maximum. A provider `NotFound`
    /// marks the local record expired and is returned as `NotFound`; the
    /// caller must create a new subscription rather than retry.
    pub async fn renew(&self, subscription_id: &str) -> Result<DateTime<Utc>> {
        let local = self
            .ctx
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("subscription {}", subscription_id)))?;
        if local.status == SubscriptionStatus::Deleted {
            return Err(TrackerError::NotFound(format!("subscription {}", subscription_id)));
        }

        let token = self.ctx.tokens.access_token(&local.user_id).await?;
        let requested = Utc::now() + self.max_ttl();

        match self
            .ctx
            .provider
            .renew_subscription(&token, subscription_id, requested)
            .await?
        {
            Lookup::Found(renewed) => {
                self.ctx
                    .store
                    .extend_subscription(subscription_id, renewed.expires_at)
                    .await?;
                tracing::debug!("Renewed subscription {} until {}", subscription_id, renewed.expires_at);
                Ok(renewed.expires_at.max(local.expires_at))
            }
            Lookup::NotFound => {
                tracing::warn!("Provider no longer knows subscription {}", subscription_id);
                self.ctx
                    .store
                    .set_subscription_status(subscription_id, SubscriptionStatus::Expired)
                    .await?;
                self.audit(
                    TrackingEvent::new(
                        "subscription.lost",
                        json!({"subscription_id": subscription_id}),
                    )
                    .for_user(&local.user_id),
                )
                .await;
                Err(TrackerError::NotFound(format!("subscription {}", subscription_id)))
            }
        }
    }

    async fn renew_or_recreate(&self, subscription: &Subscription) -> Result<bool> {
        match self.renew(&subscription.subscription_id).await {
            Ok(_) => Ok(false),
            Err(TrackerError::NotFound(_)) => {
                self.create(
                    &subscription.user_id,
                    &subscription.resource,
                    &subscription.change_types,
                    None,
                )
                .await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Renews every active subscription expiring within `window_hours`.
    /// Per-subscription failures are counted, never raised.
    pub async fn renew_expiring(&self, window_hours: i64) -> Result<RenewalReport> {
        let before = Utc::now() + Duration::hours(window_hours);
        let expiring = self.ctx.store.active_subscriptions_expiring_before(before).await?;
        if expiring.is_empty() {
            return Ok(RenewalReport::default());
        }
        tracing::debug!("Renewing {} subscription(s)", expiring.len());

        let expiring = &expiring;
        let results: Vec<_> = stream::iter(0..expiring.len())
            .map(|i| async move {
                let sub = &expiring[i];
                (sub, self.renew_or_recreate(sub).await)
            })
            .buffer_unordered(RENEWAL_CONCURRENCY)
            .collect()
            .await;

        let mut report = RenewalReport::default();
        for (sub, result) in results {
            match result {
                Ok(false) => report.renewed += 1,
                Ok(true) => report.recreated += 1,
                Err(e) => {
                    tracing::error!("Failed to renew subscription {}: {}", sub.subscription_id, e);
                    report.errors += 1;
                    report.failures.push(format!("{}: {}", sub.subscription_id, e));
                }
            }
        }

        tracing::info!(
            "Subscription renewal: renewed={}, recreated={}, errors={}",
            report.renewed,
            report.recreated,
            report.errors
        );
        Ok(report)
    }

    /// Persisted subscriptions, each checked against what the provider reports.
    pub async fn list(&self, user_id: Option<&str>) -> Result<Vec<SubscriptionView>> {
        let subscriptions = self.ctx.store.list_subscriptions(user_id).await?;

        let mut by_user: BTreeMap<&str, Vec<&Subscription>> = BTreeMap::new();
        for sub in &subscriptions {
            by_user.entry(sub.user_id.as_str()).or_default().push(sub);
        }

        let mut views = Vec::with_capacity(subscriptions.len());
        for (user, subs) in by_user {
            let remote: Option<HashSet<String>> = match self.provider_ids(user).await {
                Ok(ids) => Some(ids),
                Err(e) => {
                    tracing::warn!("Could not list provider subscriptions for {}: {}", user, e);
                    None
                }
            };

            for sub in subs {
                let provider_state = match &remote {
                    Some(ids) if ids.contains(&sub.subscription_id) => ProviderState::Present,
                    Some(_) => ProviderState::Missing,
                    None => ProviderState::Unknown,
                };
                if provider_state == ProviderState::Missing && sub.status == SubscriptionStatus::Active {
                    tracing::warn!(
                        "Subscription {} of {} is active locally but missing at the provider",
                        sub.subscription_id,
                        user
                    );
                }
                views.push(SubscriptionView {
                    subscription: sub.clone(),
                    provider_state,
                });
            }
        }

        Ok(views)
    }

    async fn provider_ids(&self, user_id: &str) -> Result<HashSet<String>> {
        let token = self.ctx.tokens.access_token(user_id).await?;
        let remote = self.ctx.provider.list_subscriptions(&token).await?;
        Ok(remote.into_iter().map(|s| s.id).collect())
    }

    /// Deletes at the provider and retires the local record. Already-gone
    /// subscriptions are not an error; the result says whether this call
    /// retired a live record.
    pub async fn delete(&self, subscription_id: &str) -> Result<bool> {
        let local = match self.ctx.store.get_subscription(subscription_id).await? {
            Some(local) if local.status != SubscriptionStatus::Deleted => local,
            _ => return Ok(false),
        };

        match self.ctx.tokens.access_token(&local.user_id).await {
            Ok(token) => {
                if let Lookup::NotFound = self
                    .ctx
                    .provider
                    .delete_subscription(&token, subscription_id)
                    .await?
                {
                    tracing::debug!("Subscription {} was already gone at the provider", subscription_id);
                }
            }
            Err(TrackerError::AuthRequired { .. }) => {
                tracing::warn!(
                    "Retiring subscription {} locally; {} must reconnect",
                    subscription_id,
                    local.user_id
                );
            }
            Err(e) => return Err(e),
        }

        let retired = self
            .ctx
            .store
            .set_subscription_status(subscription_id, SubscriptionStatus::Deleted)
            .await?;
        self.audit(
            TrackingEvent::new("subscription.deleted", json!({"subscription_id": subscription_id}))
                .for_user(&local.user_id),
        )
        .await;
        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracker_core::config::{DEFAULT_CHANGE_TYPES, DEFAULT_RESOURCE};
    use tracker_core::testing::{test_context, valid_token, FakeProvider, CLIENT_STATE};
    use tracker_core::{MemoryStore, StoreTokenSource, TrackingStore};

    async fn setup() -> (Arc<MemoryStore>, Arc<FakeProvider>, SubscriptionManager) {
        let store = Arc::new(MemoryStore::new());
        store.put_token(valid_token("user-1", "me@example.com")).await;
        store.put_token(valid_token("user-2", "two@example.com")).await;
        let provider = Arc::new(FakeProvider::new());
        let manager = SubscriptionManager::new(test_context(store.clone(), provider.clone()));
        (store, provider, manager)
    }

    /// Stores a subscription known to both sides.
    async fn seed(store: &MemoryStore, provider: &FakeProvider, id: &str, user: &str, expires_in: Duration) {
        let expires_at = Utc::now() + expires_in;
        provider.add_subscription(id, expires_at);
        store
            .insert_subscription(&Subscription {
                subscription_id: id.to_string(),
                user_id: user.to_string(),
                resource: DEFAULT_RESOURCE.to_string(),
                change_types: DEFAULT_CHANGE_TYPES.to_string(),
                expires_at,
                status: SubscriptionStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_registers_webhook_and_reuses_fresh_subscription() {
        let (store, provider, manager) = setup().await;

        let first = manager
            .create("user-1", DEFAULT_RESOURCE, DEFAULT_CHANGE_TYPES, Some(Duration::days(30)))
            .await
            .unwrap();
        let second = manager
            .create("user-1", DEFAULT_RESOURCE, DEFAULT_CHANGE_TYPES, None)
            .await
            .unwrap();
        assert_eq!(first.subscription_id, second.subscription_id);

        let requests = provider.created_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].notification_url, "https://tracker.example.com/webhooks/incoming");
        assert_eq!(requests[0].client_state, CLIENT_STATE);
        assert!(requests[0].expires_at <= Utc::now() + Duration::minutes(4230));

        let stored = store.get_subscription(&first.subscription_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn create_surfaces_auth_and_provider_errors() {
        let (_, provider, manager) = setup().await;

        let err = manager
            .create("nobody", DEFAULT_RESOURCE, DEFAULT_CHANGE_TYPES, None)
            .await
            .unwrap_err();
        assert_eq!(err, TrackerError::AuthRequired { user_id: "nobody".into() });

        provider.fail_user("user-2", TrackerError::ProviderRejected("quota".into()));
        let err = manager
            .create("user-2", DEFAULT_RESOURCE, DEFAULT_CHANGE_TYPES, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::ProviderRejected(_)));
    }

    #[tokio::test]
    async fn create_requires_public_webhook_url() {
        let store = Arc::new(MemoryStore::new());
        store.put_token(valid_token("user-1", "me@example.com")).await;
        let mut config = tracker_core::testing::test_config();
        config.server.public_base_url = None;
        let ctx = TrackerContext::from_parts(
            config,
            store.clone(),
            Arc::new(FakeProvider::new()),
            Arc::new(StoreTokenSource::new(store)),
        );

        let err = SubscriptionManager::new(ctx)
            .create("user-1", DEFAULT_RESOURCE, DEFAULT_CHANGE_TYPES, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Config(_)));
    }

    #[tokio::test]
    async fn renewal_of_unknown_subscription_marks_it_expired() {
        let (store, provider, manager) = setup().await;
        seed(&store, &provider, "sub-gone", "user-1", Duration::hours(2)).await;
        provider.forget_subscription("sub-gone");

        let err = manager.renew("sub-gone").await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
        let stored = store.get_subscription("sub-gone").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn expiring_batch_isolates_rejected_renewal() {
        let (store, provider, manager) = setup().await;
        seed(&store, &provider, "sub-a", "user-1", Duration::hours(2)).await;
        seed(&store, &provider, "sub-b", "user-2", Duration::hours(4)).await;
        seed(&store, &provider, "sub-c", "user-1", Duration::hours(30)).await;
        seed(&store, &provider, "sub-d", "user-2", Duration::hours(48)).await;
        seed(&store, &provider, "sub-e", "user-1", Duration::hours(70)).await;
        provider.reject_renewal("sub-b");
        let before = store.get_subscription("sub-b").await.unwrap().unwrap().expires_at;

        let report = manager.renew_expiring(6).await.unwrap();
        assert_eq!(report.renewed, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(report.recreated, 0);
        assert!(report.failures[0].starts_with("sub-b"));
        assert_eq!(provider.renew_calls(), 2);

        let renewed = store.get_subscription("sub-a").await.unwrap().unwrap();
        assert!(renewed.expires_at > Utc::now() + Duration::hours(48));
        let failed = store.get_subscription("sub-b").await.unwrap().unwrap();
        assert_eq!(failed.expires_at, before);
        assert_eq!(failed.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn sweep_recreates_subscriptions_the_provider_dropped() {
        let (store, provider, manager) = setup().await;
        seed(&store, &provider, "sub-old", "user-1", Duration::hours(1)).await;
        provider.forget_subscription("sub-old");

        let report = manager.renew_expiring(12).await.unwrap();
        assert_eq!(report, RenewalReport { renewed: 0, errors: 0, recreated: 1, failures: vec![] });

        let old = store.get_subscription("sub-old").await.unwrap().unwrap();
        assert_eq!(old.status, SubscriptionStatus::Expired);
        let replacement = store
            .active_subscription_for("user-1", DEFAULT_RESOURCE)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(replacement.subscription_id, "sub-old");
    }

    #[tokio::test]
    async fn concurrent_renewals_converge_on_latest_expiry() {
        let (store, provider, manager) = setup().await;
        seed(&store, &provider, "sub-1", "user-1", Duration::hours(1)).await;

        let renewals = (0..6).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.renew("sub-1").await.unwrap() })
        });
        let results: Vec<DateTime<Utc>> = futures::future::join_all(renewals)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let latest = results.iter().max().copied().unwrap();
        let stored = store.get_subscription("sub-1").await.unwrap().unwrap();
        assert_eq!(stored.expires_at, latest);
        assert_eq!(provider.renew_calls(), 6);

        // A stale answer arriving late cannot pull the expiry back.
        assert!(!store
            .extend_subscription("sub-1", latest - Duration::minutes(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn list_flags_subscriptions_missing_at_provider() {
        let (store, provider, manager) = setup().await;
        seed(&store, &provider, "sub-live", "user-1", Duration::hours(20)).await;
        seed(&store, &provider, "sub-ghost", "user-1", Duration::hours(20)).await;
        seed(&store, &provider, "sub-other", "user-2", Duration::hours(20)).await;
        provider.forget_subscription("sub-ghost");

        let views = manager.list(Some("user-1")).await.unwrap();
        assert_eq!(views.len(), 2);
        for view in &views {
            let expected = if view.subscription.subscription_id == "sub-ghost" {
                ProviderState::Missing
            } else {
                ProviderState::Present
            };
            assert_eq!(view.provider_state, expected);
        }
        // Reported, not removed.
        let ghost = store.get_subscription("sub-ghost").await.unwrap().unwrap();
        assert_eq!(ghost.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, provider, manager) = setup().await;
        seed(&store, &provider, "sub-1", "user-1", Duration::hours(20)).await;
        seed(&store, &provider, "sub-2", "user-1", Duration::hours(20)).await;
        provider.forget_subscription("sub-2");

        assert!(manager.delete("sub-1").await.unwrap());
        assert!(!manager.delete("sub-1").await.unwrap());
        assert!(provider.subscription("sub-1").is_none());

        assert!(manager.delete("sub-2").await.unwrap());
        assert!(!manager.delete("never-existed").await.unwrap());
        let retired = store.get_subscription("sub-2").await.unwrap().unwrap();
        assert_eq!(retired.status, SubscriptionStatus::Deleted);
    }
}
