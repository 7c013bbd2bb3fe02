use anyhow::Result;
use chrono::Utc;
use std::time::Duration;

use tracker_core::TrackerContext;

use crate::reconciler::Reconciler;

const SWEEP_INTERVAL_SECS: u64 = 300;

/// Expires overdue tracked messages on a fixed cadence.
pub async fn run(ctx: TrackerContext) -> Result<()> {
    tracing::info!("Starting expiry sweeper");
    let reconciler = Reconciler::new(ctx.store.clone());

    loop {
        match reconciler.expire_overdue(Utc::now()).await {
            Ok(report) => {
                for error in &report.errors {
                    tracing::warn!("Expiry sweep item failed: {}", error);
                }
            }
            Err(e) => tracing::error!("Error in expiry sweeper: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECS)).await;
    }
}
