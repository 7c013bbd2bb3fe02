use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use tracker_core::{TrackerContext, TrackingMode};
use tracker_replies::sync_all_pending_replies;

use crate::controller::ModeController;

/// Supervisory loop: re-judges webhook health, then runs the reply sync sweep
/// whenever the current mode says one is due. Runs independently of request
/// handling; several instances may run it side by side.
pub async fn run(ctx: TrackerContext, controller: Arc<ModeController>) -> Result<()> {
    let check_every = Duration::from_secs(ctx.config.tracking.health_check_interval_minutes.max(1) * 60);
    let max_age_days = ctx.config.tracking.reply_sync_max_age_days;
    tracing::info!("Starting adaptive mode controller (health check every {:?})", check_every);

    loop {
        let report = controller.check_health().await;
        if !report.healthy {
            tracing::debug!("Webhook unhealthy: {:?}", report.recommendations);
        }

        let now = Utc::now();
        if controller.sync_due(now).await {
            let reason = match report.mode {
                TrackingMode::Poll => "poll",
                TrackingMode::Push => "backstop",
            };
            tracing::info!("Running {} reply sync", reason);
            match sync_all_pending_replies(&ctx, max_age_days).await {
                Ok(sweep) => controller.record_sync(&sweep, now).await,
                Err(e) => tracing::error!("Error in reply sync sweep: {}", e),
            }
        }

        tokio::time::sleep(check_every).await;
    }
}
