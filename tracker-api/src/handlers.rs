use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use tracker_core::config::{DEFAULT_CHANGE_TYPES, DEFAULT_RESOURCE};
use tracker_core::{TrackerError, TrackingStore};
use tracker_replies::{
    process_notifications, sync_all_pending_replies, sync_user_pending_replies, Outcome, Reconciler,
};

use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::ApiContext;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "tracker-api"
    }))
}

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

/// Provider callback. Always acknowledged with 200 so failures here never
/// trigger redelivery storms; problems are reported in the body and logs.
pub async fn webhook(
    Extension(ctx): Extension<ApiContext>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if let Some(token) = query.validation_token {
        tracing::info!("Answering webhook validation handshake");
        return (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], token).into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Unreadable webhook body: {}", e);
            Value::Null
        }
    };

    let report = process_notifications(&ctx.tracker, &payload).await;
    Json(json!({
        "success": report.errors == 0,
        "processed": report.processed,
        "updated": report.updated,
        "errors": report.errors,
    }))
    .into_response()
}

pub async fn tracking_status(Extension(ctx): Extension<ApiContext>) -> Json<Value> {
    let report = ctx.controller.status().await;
    Json(json!({"success": true, "status": report}))
}

pub async fn check_tracking_status(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Value>> {
    require_scheduler(&caller)?;
    let report = ctx.controller.check_health().await;
    Ok(Json(json!({"success": true, "status": report})))
}

fn require_user(caller: &Caller) -> ApiResult<&str> {
    caller
        .user_id()
        .ok_or_else(|| ApiError::Forbidden("a user token is required".to_string()))
}

/// Actions spanning every tenant belong to the scheduler.
fn require_scheduler(caller: &Caller) -> ApiResult<()> {
    match caller {
        Caller::Scheduler => Ok(()),
        Caller::User(_) => Err(ApiError::Forbidden("the cron secret is required".to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSubscriptionBody {
    pub resource: Option<String>,
    pub change_types: Option<String>,
    pub ttl_minutes: Option<i64>,
}

pub async fn create_subscription(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
    body: Option<Json<CreateSubscriptionBody>>,
) -> ApiResult<Json<Value>> {
    let user_id = require_user(&caller)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let subscription = ctx
        .subscriptions
        .create(
            user_id,
            body.resource.as_deref().unwrap_or(DEFAULT_RESOURCE),
            body.change_types.as_deref().unwrap_or(DEFAULT_CHANGE_TYPES),
            body.ttl_minutes.map(Duration::minutes),
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "subscription_id": subscription.subscription_id,
        "expires_at": subscription.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionQuery {
    pub subscription_id: Option<String>,
}

pub async fn list_subscriptions(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Value>> {
    let user_id = require_user(&caller)?;
    let subscriptions = ctx.subscriptions.list(Some(user_id)).await?;
    Ok(Json(json!({"success": true, "subscriptions": subscriptions})))
}

pub async fn delete_subscription(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<SubscriptionQuery>,
) -> ApiResult<Json<Value>> {
    let user_id = require_user(&caller)?;
    let subscription_id = query
        .subscription_id
        .ok_or_else(|| ApiError::BadRequest("subscription_id is required".to_string()))?;

    let owned = ctx
        .tracker
        .store
        .get_subscription(&subscription_id)
        .await?
        .map_or(false, |s| s.user_id == user_id);
    if !owned {
        return Err(TrackerError::NotFound(format!("subscription {}", subscription_id)).into());
    }

    let deleted = ctx.subscriptions.delete(&subscription_id).await?;
    Ok(Json(json!({"success": true, "deleted": deleted})))
}

#[derive(Debug, Default, Deserialize)]
pub struct RenewBody {
    pub window_hours: Option<i64>,
}

pub async fn renew_subscriptions(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
    body: Option<Json<RenewBody>>,
) -> ApiResult<Json<Value>> {
    require_scheduler(&caller)?;
    let window = body
        .and_then(|Json(b)| b.window_hours)
        .unwrap_or(ctx.tracker.config.tracking.renewal_window_hours);
    let report = ctx.subscriptions.renew_expiring(window).await?;
    Ok(Json(json!({
        "success": true,
        "renewed": report.renewed,
        "recreated": report.recreated,
        "errors": report.errors,
        "failures": report.failures,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncBody {
    pub max_age_days: Option<i64>,
}

/// The scheduler sweeps every mailbox; a user only sweeps their own.
pub async fn sync_replies(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
    body: Option<Json<SyncBody>>,
) -> ApiResult<Json<Value>> {
    let max_age_days = body
        .and_then(|Json(b)| b.max_age_days)
        .unwrap_or(ctx.tracker.config.tracking.reply_sync_max_age_days);
    if max_age_days <= 0 {
        return Err(ApiError::BadRequest("max_age_days must be positive".to_string()));
    }

    let report = match &caller {
        Caller::Scheduler => {
            let report = sync_all_pending_replies(&ctx.tracker, max_age_days).await?;
            ctx.controller.record_sync(&report, chrono::Utc::now()).await;
            report
        }
        Caller::User(user_id) => sync_user_pending_replies(&ctx.tracker, user_id, max_age_days).await?,
    };

    Ok(Json(json!({
        "success": true,
        "processed": report.processed,
        "updated": report.updated,
        "errors": report.errors,
        "skipped": report.skipped,
        "paused_users": report.paused_users,
    })))
}

pub async fn stop_tracking(
    Extension(ctx): Extension<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user_id = require_user(&caller)?;
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid tracked message id '{}'", id)))?;

    let owned = ctx
        .tracker
        .store
        .get_tracked(id)
        .await?
        .map_or(false, |t| t.user_id == user_id);
    if !owned {
        return Err(TrackerError::NotFound(format!("tracked message {}", id)).into());
    }

    let reconciler = Reconciler::new(ctx.tracker.store.clone());
    match reconciler.stop(id).await? {
        Outcome::Applied => Ok(Json(json!({"success": true, "status": "stopped", "changed": true}))),
        Outcome::AlreadyFinal(status) => {
            Ok(Json(json!({"success": true, "status": status, "changed": false})))
        }
        Outcome::NotFound => Err(TrackerError::NotFound(format!("tracked message {}", id)).into()),
    }
}
