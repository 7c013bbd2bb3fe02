use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of a provider call that addresses a specific resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

/// A bearer token together with the user it belongs to.
#[derive(Clone)]
pub struct AccessToken {
    pub user_id: String,
    pub token: String,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("user_id", &self.user_id)
            .field("token", &"****")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub resource: String,
    pub change_types: String,
    pub notification_url: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub resource: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folder {
    Inbox,
    SentItems,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "emailAddress", default)]
    pub email_address: EmailAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// A message exactly as the provider describes it. Every field is optional;
/// ingestion decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub internet_message_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body_preview: Option<String>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub from: Option<Recipient>,
    #[serde(default)]
    pub to_recipients: Vec<Recipient>,
    #[serde(default)]
    pub internet_message_headers: Vec<MessageHeader>,
}

impl ProviderMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.internet_message_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn sender(&self) -> Option<&str> {
        self.from.as_ref()?.email_address.address.as_deref()
    }

    pub fn first_recipient(&self) -> Option<&str> {
        self.to_recipients
            .iter()
            .find_map(|r| r.email_address.address.as_deref())
    }
}

/// The mail provider capabilities the tracking core consumes.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn create_subscription(
        &self,
        token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<ProviderSubscription>;

    async fn renew_subscription(
        &self,
        token: &AccessToken,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Lookup<ProviderSubscription>>;

    async fn list_subscriptions(&self, token: &AccessToken) -> Result<Vec<ProviderSubscription>>;

    async fn delete_subscription(&self, token: &AccessToken, subscription_id: &str)
        -> Result<Lookup<()>>;

    /// Fetches a message by the resource path carried in a push notification.
    async fn get_message(&self, token: &AccessToken, resource: &str)
        -> Result<Lookup<ProviderMessage>>;

    async fn list_messages(
        &self,
        token: &AccessToken,
        folder: Folder,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProviderMessage>>;
}
