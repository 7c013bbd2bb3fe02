//! Open and click tracking.
//!
//! The response is built first and never depends on bookkeeping. Recording
//! runs on a detached task, so a slow or failing store cannot delay or break
//! the image or the redirect.

use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use reqwest::Url;
use serde::Deserialize;

use tracker_core::{DetectionMethod, TrackerContext};
use tracker_replies::{engagement_signal, record_engagement};

use crate::ApiContext;

/// A transparent 1x1 GIF.
pub const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Records an engagement in the background. Returns immediately.
pub fn spawn_bookkeeping(ctx: TrackerContext, raw_id: String, method: DetectionMethod) {
    tokio::spawn(async move {
        let signal = match engagement_signal(&raw_id, method) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!("Ignoring {}: {}", method, e);
                return;
            }
        };
        match record_engagement(&ctx, &signal).await {
            Ok(Some(outcome)) => tracing::debug!("{} on {} -> {:?}", method, raw_id, outcome),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to record {} for {}: {}", method, raw_id, e),
        }
    });
}

fn pixel_response() -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

pub async fn pixel(Extension(ctx): Extension<ApiContext>, Path(id): Path<String>) -> Response {
    let response = pixel_response();
    spawn_bookkeeping(ctx.tracker, id, DetectionMethod::PixelOpen);
    response
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: Option<String>,
}

/// Only absolute http(s) URLs are followed.
fn click_target(raw: Option<&str>) -> Option<Url> {
    let url = Url::parse(raw?.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url),
        _ => None,
    }
}

pub async fn click(
    Extension(ctx): Extension<ApiContext>,
    Path(id): Path<String>,
    Query(params): Query<ClickQuery>,
) -> Response {
    let target = match click_target(params.url.as_deref()) {
        Some(target) => target,
        None => return (StatusCode::BAD_REQUEST, "invalid redirect target").into_response(),
    };

    let response = Redirect::temporary(target.as_str()).into_response();
    spawn_bookkeeping(ctx.tracker, id, DetectionMethod::LinkClick);
    response
}
