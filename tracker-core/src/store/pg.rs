use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::{MessageIds, TrackingStore};
use crate::db::DbPool;
use crate::error::{Result, TrackerError};
use crate::schema::{incoming_messages, oauth_tokens, tracked_emails, tracking_events, webhook_subscriptions};
use crate::types::{
    IncomingMessageRecord, NewTrackedMessage, StoredToken, Subscription, SubscriptionStatus,
    TrackedMessage, TrackingEvent, TrackingStatus, Transition,
};

#[derive(Queryable, Selectable)]
#[diesel(table_name = tracked_emails)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct TrackedRow {
    id: Uuid,
    user_id: String,
    sender_address: String,
    recipient_address: String,
    subject: String,
    provider_message_id: Option<String>,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
    sent_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    status: String,
    reply_received_at: Option<DateTime<Utc>>,
    reply_method: Option<String>,
    stopped_at: Option<DateTime<Utc>>,
}

impl TryFrom<TrackedRow> for TrackedMessage {
    type Error = TrackerError;

    fn try_from(row: TrackedRow) -> Result<Self> {
        Ok(TrackedMessage {
            id: row.id,
            user_id: row.user_id,
            sender_address: row.sender_address,
            recipient_address: row.recipient_address,
            subject: row.subject,
            provider_message_id: row.provider_message_id,
            conversation_id: row.conversation_id,
            internet_message_id: row.internet_message_id,
            sent_at: row.sent_at,
            expires_at: row.expires_at,
            status: row.status.parse()?,
            reply_received_at: row.reply_received_at,
            reply_method: row.reply_method.as_deref().map(str::parse).transpose()?,
            stopped_at: row.stopped_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = tracked_emails)]
struct NewTrackedRow<'a> {
    id: Uuid,
    user_id: &'a str,
    sender_address: &'a str,
    recipient_address: &'a str,
    subject: &'a str,
    provider_message_id: Option<&'a str>,
    conversation_id: Option<&'a str>,
    internet_message_id: Option<&'a str>,
    sent_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    status: &'a str,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = incoming_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct IncomingRow {
    user_id: String,
    provider_message_id: String,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
    in_reply_to: Option<String>,
    sender_address: String,
    recipient_address: String,
    subject: String,
    received_at: DateTime<Utc>,
    body_preview: String,
    is_read: bool,
}

impl From<IncomingRow> for IncomingMessageRecord {
    fn from(row: IncomingRow) -> Self {
        IncomingMessageRecord {
            user_id: row.user_id,
            provider_message_id: row.provider_message_id,
            conversation_id: row.conversation_id,
            internet_message_id: row.internet_message_id,
            in_reply_to: row.in_reply_to,
            sender_address: row.sender_address,
            recipient_address: row.recipient_address,
            subject: row.subject,
            received_at: row.received_at,
            body_preview: row.body_preview,
            is_read: row.is_read,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = incoming_messages)]
struct NewIncomingRow<'a> {
    user_id: &'a str,
    provider_message_id: &'a str,
    conversation_id: Option<&'a str>,
    internet_message_id: Option<&'a str>,
    in_reply_to: Option<&'a str>,
    sender_address: &'a str,
    recipient_address: &'a str,
    subject: &'a str,
    received_at: DateTime<Utc>,
    body_preview: &'a str,
    is_read: bool,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = webhook_subscriptions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct SubscriptionRow {
    subscription_id: String,
    user_id: String,
    resource: String,
    change_types: String,
    expires_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = TrackerError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            resource: row.resource,
            change_types: row.change_types,
            expires_at: row.expires_at,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

fn collect_tracked(rows: Vec<TrackedRow>) -> Result<Vec<TrackedMessage>> {
    rows.into_iter().map(TrackedMessage::try_from).collect()
}

fn collect_subscriptions(rows: Vec<SubscriptionRow>) -> Result<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

fn collect_incoming(rows: Vec<IncomingRow>) -> Vec<IncomingMessageRecord> {
    rows.into_iter().map(IncomingMessageRecord::from).collect()
}

/// Postgres-backed store over the shared deadpool.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackingStore for PgStore {
    async fn insert_tracked(&self, new: NewTrackedMessage) -> Result<TrackedMessage> {
        let mut conn = self.pool.get().await?;
        let row: TrackedRow = diesel::insert_into(tracked_emails::table)
            .values(NewTrackedRow {
                id: Uuid::new_v4(),
                user_id: &new.user_id,
                sender_address: &new.sender_address,
                recipient_address: &new.recipient_address,
                subject: &new.subject,
                provider_message_id: new.provider_message_id.as_deref(),
                conversation_id: new.conversation_id.as_deref(),
                internet_message_id: new.internet_message_id.as_deref(),
                sent_at: new.sent_at,
                expires_at: new.expires_at,
                status: TrackingStatus::Pending.as_str(),
            })
            .returning(TrackedRow::as_returning())
            .get_result(&mut conn)
            .await?;
        row.try_into()
    }

    async fn get_tracked(&self, id: Uuid) -> Result<Option<TrackedMessage>> {
        let mut conn = self.pool.get().await?;
        let row: Option<TrackedRow> = tracked_emails::table
            .filter(tracked_emails::id.eq(id))
            .select(TrackedRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(TrackedMessage::try_from).transpose()
    }

    async fn list_pending(&self, sent_after: DateTime<Utc>) -> Result<Vec<TrackedMessage>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<TrackedRow> = tracked_emails::table
            .filter(tracked_emails::status.eq(TrackingStatus::Pending.as_str()))
            .filter(tracked_emails::sent_at.ge(sent_after))
            .order(tracked_emails::sent_at.asc())
            .select(TrackedRow::as_select())
            .load(&mut conn)
            .await?;
        collect_tracked(rows)
    }

    async fn pending_for_user(&self, user_id: &str) -> Result<Vec<TrackedMessage>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<TrackedRow> = tracked_emails::table
            .filter(tracked_emails::user_id.eq(user_id))
            .filter(tracked_emails::status.eq(TrackingStatus::Pending.as_str()))
            .order(tracked_emails::sent_at.asc())
            .select(TrackedRow::as_select())
            .load(&mut conn)
            .await?;
        collect_tracked(rows)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut conn = self.pool.get().await?;
        Ok(tracked_emails::table
            .filter(tracked_emails::status.eq(TrackingStatus::Pending.as_str()))
            .filter(tracked_emails::expires_at.le(now))
            .select(tracked_emails::id)
            .load(&mut conn)
            .await?)
    }

    async fn fill_message_ids(&self, id: Uuid, ids: &MessageIds) -> Result<()> {
        let mut conn = self.pool.get().await?;

        if let Some(conversation_id) = &ids.conversation_id {
            let updated = diesel::update(
                tracked_emails::table
                    .filter(tracked_emails::id.eq(id))
                    .filter(
                        tracked_emails::conversation_id
                            .is_null()
                            .or(tracked_emails::conversation_id.eq(conversation_id)),
                    ),
            )
            .set((
                tracked_emails::conversation_id.eq(conversation_id),
                tracked_emails::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;

            if updated == 0 {
                let stored: Option<Option<String>> = tracked_emails::table
                    .filter(tracked_emails::id.eq(id))
                    .select(tracked_emails::conversation_id)
                    .first(&mut conn)
                    .await
                    .optional()?;
                return match stored {
                    None => Err(TrackerError::NotFound(format!("tracked message {}", id))),
                    Some(stored) => Err(TrackerError::ConversationConflict {
                        tracked_id: id.to_string(),
                        stored: stored.unwrap_or_default(),
                        incoming: conversation_id.clone(),
                    }),
                };
            }
        }

        if let Some(internet_message_id) = &ids.internet_message_id {
            diesel::update(
                tracked_emails::table
                    .filter(tracked_emails::id.eq(id))
                    .filter(tracked_emails::internet_message_id.is_null()),
            )
            .set(tracked_emails::internet_message_id.eq(internet_message_id))
            .execute(&mut conn)
            .await?;
        }

        if let Some(provider_message_id) = &ids.provider_message_id {
            diesel::update(
                tracked_emails::table
                    .filter(tracked_emails::id.eq(id))
                    .filter(tracked_emails::provider_message_id.is_null()),
            )
            .set(tracked_emails::provider_message_id.eq(provider_message_id))
            .execute(&mut conn)
            .await?;
        }

        Ok(())
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let pending = tracked_emails::table
            .filter(tracked_emails::id.eq(id))
            .filter(tracked_emails::status.eq(TrackingStatus::Pending.as_str()));
        let target = transition.target().as_str();
        let now = Utc::now();

        let updated = match transition {
            Transition::Replied { at, method } => {
                diesel::update(pending)
                    .set((
                        tracked_emails::status.eq(target),
                        tracked_emails::reply_received_at.eq(Some(at)),
                        tracked_emails::reply_method.eq(Some(method.as_str())),
                        tracked_emails::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?
            }
            Transition::Stopped { at } => {
                diesel::update(pending)
                    .set((
                        tracked_emails::status.eq(target),
                        tracked_emails::stopped_at.eq(Some(at)),
                        tracked_emails::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?
            }
            Transition::Expired => {
                diesel::update(pending)
                    .set((
                        tracked_emails::status.eq(target),
                        tracked_emails::updated_at.eq(now),
                    ))
                    .execute(&mut conn)
                    .await?
            }
        };

        Ok(updated == 1)
    }

    async fn insert_incoming(&self, record: &IncomingMessageRecord) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let inserted = diesel::insert_into(incoming_messages::table)
            .values(NewIncomingRow {
                user_id: &record.user_id,
                provider_message_id: &record.provider_message_id,
                conversation_id: record.conversation_id.as_deref(),
                internet_message_id: record.internet_message_id.as_deref(),
                in_reply_to: record.in_reply_to.as_deref(),
                sender_address: &record.sender_address,
                recipient_address: &record.recipient_address,
                subject: &record.subject,
                received_at: record.received_at,
                body_preview: &record.body_preview,
                is_read: record.is_read,
            })
            .on_conflict((incoming_messages::user_id, incoming_messages::provider_message_id))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn known_incoming_ids(&self, user_id: &str, ids: &[String]) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = self.pool.get().await?;
        let known: Vec<String> = incoming_messages::table
            .filter(incoming_messages::user_id.eq(user_id))
            .filter(incoming_messages::provider_message_id.eq_any(ids))
            .select(incoming_messages::provider_message_id)
            .load(&mut conn)
            .await?;
        Ok(known.into_iter().collect())
    }

    async fn incoming_in_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<IncomingRow> = incoming_messages::table
            .filter(incoming_messages::user_id.eq(user_id))
            .filter(incoming_messages::conversation_id.eq(conversation_id))
            .filter(incoming_messages::received_at.gt(after))
            .order(incoming_messages::received_at.asc())
            .select(IncomingRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(collect_incoming(rows))
    }

    async fn incoming_replying_to(
        &self,
        user_id: &str,
        internet_message_id: &str,
    ) -> Result<Vec<IncomingMessageRecord>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<IncomingRow> = incoming_messages::table
            .filter(incoming_messages::user_id.eq(user_id))
            .filter(incoming_messages::in_reply_to.eq(internet_message_id))
            .order(incoming_messages::received_at.asc())
            .select(IncomingRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(collect_incoming(rows))
    }

    async fn incoming_from_sender(
        &self,
        user_id: &str,
        sender_address: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<IncomingMessageRecord>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<IncomingRow> = incoming_messages::table
            .filter(incoming_messages::user_id.eq(user_id))
            .filter(incoming_messages::sender_address.eq(sender_address))
            .filter(incoming_messages::received_at.gt(after))
            .order(incoming_messages::received_at.asc())
            .select(IncomingRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(collect_incoming(rows))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(webhook_subscriptions::table)
            .values((
                webhook_subscriptions::subscription_id.eq(&subscription.subscription_id),
                webhook_subscriptions::user_id.eq(&subscription.user_id),
                webhook_subscriptions::resource.eq(&subscription.resource),
                webhook_subscriptions::change_types.eq(&subscription.change_types),
                webhook_subscriptions::expires_at.eq(subscription.expires_at),
                webhook_subscriptions::status.eq(subscription.status.as_str()),
                webhook_subscriptions::created_at.eq(subscription.created_at),
            ))
            .on_conflict(webhook_subscriptions::subscription_id)
            .do_update()
            .set((
                webhook_subscriptions::expires_at.eq(subscription.expires_at),
                webhook_subscriptions::status.eq(subscription.status.as_str()),
                webhook_subscriptions::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        let mut conn = self.pool.get().await?;
        let row: Option<SubscriptionRow> = webhook_subscriptions::table
            .filter(webhook_subscriptions::subscription_id.eq(subscription_id))
            .select(SubscriptionRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(&self, user_id: Option<&str>) -> Result<Vec<Subscription>> {
        let mut conn = self.pool.get().await?;
        let mut query = webhook_subscriptions::table
            .order(webhook_subscriptions::created_at.asc())
            .select(SubscriptionRow::as_select())
            .into_boxed();
        if let Some(user_id) = user_id {
            query = query.filter(webhook_subscriptions::user_id.eq(user_id));
        }
        let rows: Vec<SubscriptionRow> = query.load(&mut conn).await?;
        collect_subscriptions(rows)
    }

    async fn active_subscription_for(
        &self,
        user_id: &str,
        resource: &str,
    ) -> Result<Option<Subscription>> {
        let mut conn = self.pool.get().await?;
        let row: Option<SubscriptionRow> = webhook_subscriptions::table
            .filter(webhook_subscriptions::user_id.eq(user_id))
            .filter(webhook_subscriptions::resource.eq(resource))
            .filter(webhook_subscriptions::status.eq(SubscriptionStatus::Active.as_str()))
            .order(webhook_subscriptions::expires_at.desc())
            .select(SubscriptionRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Subscription::try_from).transpose()
    }

    async fn active_subscriptions_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<SubscriptionRow> = webhook_subscriptions::table
            .filter(webhook_subscriptions::status.eq(SubscriptionStatus::Active.as_str()))
            .filter(webhook_subscriptions::expires_at.le(before))
            .order(webhook_subscriptions::expires_at.asc())
            .select(SubscriptionRow::as_select())
            .load(&mut conn)
            .await?;
        collect_subscriptions(rows)
    }

    async fn extend_subscription(
        &self,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(
            webhook_subscriptions::table
                .filter(webhook_subscriptions::subscription_id.eq(subscription_id))
                .filter(webhook_subscriptions::expires_at.lt(expires_at)),
        )
        .set((
            webhook_subscriptions::expires_at.eq(expires_at),
            webhook_subscriptions::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }

    async fn set_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(
            webhook_subscriptions::table
                .filter(webhook_subscriptions::subscription_id.eq(subscription_id))
                .filter(webhook_subscriptions::status.ne(status.as_str()))
                .filter(webhook_subscriptions::status.ne(SubscriptionStatus::Deleted.as_str())),
        )
        .set((
            webhook_subscriptions::status.eq(status.as_str()),
            webhook_subscriptions::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }

    async fn count_active_subscriptions(&self, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        Ok(webhook_subscriptions::table
            .filter(webhook_subscriptions::status.eq(SubscriptionStatus::Active.as_str()))
            .filter(webhook_subscriptions::expires_at.gt(now))
            .count()
            .get_result(&mut conn)
            .await?)
    }

    async fn stored_token(&self, user_id: &str) -> Result<Option<StoredToken>> {
        let mut conn = self.pool.get().await?;
        let row: Option<(String, String, String, DateTime<Utc>)> = oauth_tokens::table
            .filter(oauth_tokens::user_id.eq(user_id))
            .select((
                oauth_tokens::user_id,
                oauth_tokens::email,
                oauth_tokens::access_token,
                oauth_tokens::expires_at,
            ))
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(|(user_id, email, access_token, expires_at)| StoredToken {
            user_id,
            email,
            access_token,
            expires_at,
        }))
    }

    async fn append_event(&self, event: TrackingEvent) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(tracking_events::table)
            .values((
                tracking_events::tracked_email_id.eq(event.tracked_email_id),
                tracking_events::user_id.eq(event.user_id),
                tracking_events::event_type.eq(event.event_type),
                tracking_events::detail.eq(event.detail),
                tracking_events::created_at.eq(event.created_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

/// Needs a disposable Postgres named by `TEST_DATABASE_URL`:
/// `cargo test -p tracker-core -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{create_pool, run_migrations};
    use crate::types::DetectionMethod;
    use chrono::{Duration, SubsecRound};

    static MIGRATED: tokio::sync::OnceCell<()> = tokio::sync::OnceCell::const_new();

    async fn store() -> PgStore {
        let config = DatabaseConfig {
            url: std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set"),
            max_connections: 2,
        };
        MIGRATED
            .get_or_init(|| async { run_migrations(&config).await.unwrap() })
            .await;
        PgStore::new(create_pool(&config).await.unwrap())
    }

    fn new_message(conversation_id: Option<&str>) -> NewTrackedMessage {
        NewTrackedMessage {
            user_id: format!("user-{}", Uuid::new_v4()),
            sender_address: "me@example.com".into(),
            recipient_address: "lead@example.com".into(),
            subject: "Quick question".into(),
            provider_message_id: None,
            conversation_id: conversation_id.map(str::to_string),
            internet_message_id: None,
            sent_at: Utc::now().trunc_subsecs(0),
            expires_at: None,
        }
    }

    #[tokio::test]
    #[ignore = "needs TEST_DATABASE_URL"]
    async fn status_moves_out_of_pending_once() {
        let store = store().await;
        let msg = store.insert_tracked(new_message(None)).await.unwrap();
        let at = Utc::now().trunc_subsecs(0);
        let replied = Transition::Replied {
            at,
            method: DetectionMethod::InReplyTo,
        };

        assert!(store.transition(msg.id, replied).await.unwrap());
        assert!(!store.transition(msg.id, replied).await.unwrap());
        assert!(!store.transition(msg.id, Transition::Expired).await.unwrap());

        let stored = store.get_tracked(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TrackingStatus::Replied);
        assert_eq!(stored.reply_received_at, Some(at));
        assert_eq!(stored.reply_method, Some(DetectionMethod::InReplyTo));
    }

    #[tokio::test]
    #[ignore = "needs TEST_DATABASE_URL"]
    async fn conversation_id_fills_once_and_conflicts_after() {
        let store = store().await;
        let msg = store.insert_tracked(new_message(None)).await.unwrap();

        let first = MessageIds {
            conversation_id: Some("conv-a".into()),
            ..Default::default()
        };
        store.fill_message_ids(msg.id, &first).await.unwrap();
        store.fill_message_ids(msg.id, &first).await.unwrap();

        let other = MessageIds {
            conversation_id: Some("conv-b".into()),
            ..Default::default()
        };
        let err = store.fill_message_ids(msg.id, &other).await.unwrap_err();
        assert!(matches!(err, TrackerError::ConversationConflict { .. }));

        let missing = store.fill_message_ids(Uuid::new_v4(), &first).await.unwrap_err();
        assert!(matches!(missing, TrackerError::NotFound(_)));

        let stored = store.get_tracked(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.conversation_id.as_deref(), Some("conv-a"));
    }

    #[tokio::test]
    #[ignore = "needs TEST_DATABASE_URL"]
    async fn subscription_expiry_moves_forward_and_deleted_is_final() {
        let store = store().await;
        let now = Utc::now().trunc_subsecs(0);
        let id = format!("sub-{}", Uuid::new_v4());
        store
            .insert_subscription(&Subscription {
                subscription_id: id.clone(),
                user_id: "user-1".into(),
                resource: "me/messages".into(),
                change_types: "created".into(),
                expires_at: now + Duration::hours(2),
                status: SubscriptionStatus::Active,
                created_at: now,
            })
            .await
            .unwrap();

        assert!(store.extend_subscription(&id, now + Duration::hours(48)).await.unwrap());
        assert!(!store.extend_subscription(&id, now + Duration::hours(24)).await.unwrap());
        let sub = store.get_subscription(&id).await.unwrap().unwrap();
        assert_eq!(sub.expires_at, now + Duration::hours(48));

        assert!(store.set_subscription_status(&id, SubscriptionStatus::Deleted).await.unwrap());
        assert!(!store.set_subscription_status(&id, SubscriptionStatus::Expired).await.unwrap());
        let sub = store.get_subscription(&id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Deleted);
    }
}
