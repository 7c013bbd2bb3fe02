use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::error::{Result, TrackerError};
use crate::provider::AccessToken;
use crate::store::TrackingStore;
use crate::types::normalize_address;

/// Tokens this close to expiry are treated as already expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// "Give me a valid access token for user U". Refresh happens elsewhere;
/// this side only distinguishes usable tokens from `AuthRequired`.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, user_id: &str) -> Result<AccessToken>;

    /// The address the user sends mail from, if known.
    async fn mailbox_address(&self, user_id: &str) -> Result<Option<String>>;
}

/// Reads tokens the credential service keeps in the shared store.
pub struct StoreTokenSource {
    store: Arc<dyn TrackingStore>,
}

impl StoreTokenSource {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenSource for StoreTokenSource {
    async fn access_token(&self, user_id: &str) -> Result<AccessToken> {
        let token = self
            .store
            .stored_token(user_id)
            .await?
            .ok_or_else(|| TrackerError::AuthRequired {
                user_id: user_id.to_string(),
            })?;

        if token.expires_at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) {
            tracing::debug!("Stored token for {} is expired", user_id);
            return Err(TrackerError::AuthRequired {
                user_id: user_id.to_string(),
            });
        }

        Ok(AccessToken {
            user_id: token.user_id,
            token: token.access_token,
        })
    }

    async fn mailbox_address(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .stored_token(user_id)
            .await?
            .map(|t| normalize_address(&t.email)))
    }
}
