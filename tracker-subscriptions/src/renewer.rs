use anyhow::Result;
use std::time::Duration;

use tracker_core::TrackerContext;

use crate::manager::SubscriptionManager;

/// Keeps push subscriptions alive by renewing the ones about to lapse.
pub async fn run(ctx: TrackerContext) -> Result<()> {
    let window_hours = ctx.config.tracking.renewal_window_hours;
    let interval = Duration::from_secs(ctx.config.tracking.renewal_interval_minutes.max(1) * 60);
    tracing::info!(
        "Starting subscription renewer (window {}h, every {:?})",
        window_hours,
        interval
    );

    let manager = SubscriptionManager::new(ctx);
    loop {
        match manager.renew_expiring(window_hours).await {
            Ok(report) => {
                if report.errors > 0 {
                    tracing::warn!("{} subscription renewal(s) failed: {:?}", report.errors, report.failures);
                }
            }
            Err(e) => tracing::error!("Error in subscription renewer: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
}
