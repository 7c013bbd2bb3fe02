use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::db::create_pool;
use crate::graph::GraphClient;
use crate::provider::MailProvider;
use crate::store::{MemoryStore, PgStore, TrackingStore};
use crate::token::{StoreTokenSource, TokenSource};

/// Shared handles passed to every handler and background loop.
#[derive(Clone)]
pub struct TrackerContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn TrackingStore>,
    pub provider: Arc<dyn MailProvider>,
    pub tokens: Arc<dyn TokenSource>,
}

impl TrackerContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn TrackingStore> = match config.tracking.store {
            StoreBackend::Postgres => Arc::new(PgStore::new(create_pool(&config.database).await?)),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; tracking state is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };
        let provider: Arc<dyn MailProvider> = Arc::new(GraphClient::new(&config.provider)?);
        let tokens: Arc<dyn TokenSource> = Arc::new(StoreTokenSource::new(store.clone()));

        Ok(Self::from_parts(config, store, provider, tokens))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn TrackingStore>,
        provider: Arc<dyn MailProvider>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        TrackerContext {
            config: Arc::new(config),
            store,
            provider,
            tokens,
        }
    }
}
