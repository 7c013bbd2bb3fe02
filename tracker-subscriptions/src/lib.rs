pub mod manager;
pub mod renewer;

pub use manager::{ProviderState, RenewalReport, SubscriptionManager, SubscriptionView};
pub use renewer::run;
