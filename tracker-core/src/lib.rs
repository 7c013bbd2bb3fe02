pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod graph;
pub mod provider;
pub mod schema;
pub mod store;
pub mod token;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use context::TrackerContext;
pub use db::DbPool;
pub use error::{Result, TrackerError};
pub use provider::{AccessToken, Lookup, MailProvider};
pub use store::{MemoryStore, MessageIds, PgStore, TrackingStore};
pub use token::{StoreTokenSource, TokenSource};
pub use types::{
    DetectionMethod, IncomingMessageRecord, NewTrackedMessage, Subscription, SubscriptionStatus,
    TrackedMessage, TrackingEvent, TrackingMode, TrackingStatus, Transition,
};
