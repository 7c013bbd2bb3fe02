use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::handlers;
use crate::pixel;
use crate::ApiContext;

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    match origins {
        Some(origins) => {
            let mut cors = CorsLayer::new();
            for origin in origins.split(',').map(|s| s.trim()) {
                if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                    cors = cors.allow_origin(parsed);
                }
            }
            cors.allow_methods(Any).allow_headers(Any)
        }
        None => {
            tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
            CorsLayer::permissive()
        }
    }
}

pub fn router(ctx: ApiContext) -> Router {
    let cors = cors_layer(ctx.tracker.config.server.cors_origins.as_deref());

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/incoming", post(handlers::webhook))
        .route(
            "/tracking/status",
            get(handlers::tracking_status).post(handlers::check_tracking_status),
        )
        .route(
            "/subscriptions",
            get(handlers::list_subscriptions)
                .post(handlers::create_subscription)
                .delete(handlers::delete_subscription),
        )
        .route("/subscriptions/renew", post(handlers::renew_subscriptions))
        .route("/replies/sync", post(handlers::sync_replies))
        .route("/tracked/:id/stop", post(handlers::stop_tracking))
        .route("/pixel/:id", get(pixel::pixel))
        .route("/click/:id", get(pixel::click))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(Extension(ctx))
                .layer(middleware::from_fn(auth::auth_middleware)),
        )
}

pub async fn run(ctx: ApiContext) -> Result<()> {
    let server = &ctx.tracker.config.server;
    let host: std::net::IpAddr = server.host.parse()?;
    let addr = SocketAddr::from((host, server.api_port));
    let app = router(ctx);

    tracing::info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
