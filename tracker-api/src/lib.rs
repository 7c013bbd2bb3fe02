pub mod auth;
pub mod error;
pub mod handlers;
pub mod pixel;
pub mod server;

use std::sync::Arc;

use tracker_adaptive::ModeController;
use tracker_core::TrackerContext;
use tracker_subscriptions::SubscriptionManager;

pub use server::{router, run};

/// Request-scoped handles, shared through an `Extension` layer.
#[derive(Clone)]
pub struct ApiContext {
    pub tracker: TrackerContext,
    pub controller: Arc<ModeController>,
    pub subscriptions: SubscriptionManager,
}

impl ApiContext {
    pub fn new(tracker: TrackerContext, controller: Arc<ModeController>) -> Self {
        ApiContext {
            subscriptions: SubscriptionManager::new(tracker.clone()),
            tracker,
            controller,
        }
    }
}
