use anyhow::Result;
use std::sync::Arc;
use tracker_adaptive::ModeController;
use tracker_api::ApiContext;
use tracker_core::config::StoreBackend;
use tracker_core::{db, Config, TrackerContext};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG may come from .env
    let _ = dotenv::dotenv();
    init_tracing();

    tracing::info!("Starting reply tracker");

    let config = Config::from_env();
    if config.tracking.store == StoreBackend::Postgres {
        db::run_migrations(&config.database).await?;
    }
    let ctx = TrackerContext::new(config).await?;
    let controller = Arc::new(ModeController::new(ctx.clone())?);

    tracing::info!("Tracker context initialized");

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = tracker_subscriptions::run(ctx_clone).await {
            tracing::error!("Subscription renewer error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = tracker_replies::run(ctx_clone).await {
            tracing::error!("Expiry sweeper error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    let controller_clone = controller.clone();
    tokio::spawn(async move {
        if let Err(e) = tracker_adaptive::run(ctx_clone, controller_clone).await {
            tracing::error!("Mode supervisor error: {}", e);
        }
    });

    tracing::info!("Starting API server");
    tracker_api::run(ApiContext::new(ctx, controller)).await?;

    Ok(())
}
