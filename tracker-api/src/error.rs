use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracker_core::TrackerError;

/// Failure of an explicit, dashboard-facing action.
#[derive(Debug)]
pub enum ApiError {
    Tracker(TrackerError),
    BadRequest(String),
    Forbidden(String),
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        ApiError::Tracker(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Tracker(e) => match e {
                TrackerError::AuthRequired { .. } => StatusCode::UNAUTHORIZED,
                TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
                TrackerError::ProviderRejected(_)
                | TrackerError::MalformedSignal(_)
                | TrackerError::ConversationConflict { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                TrackerError::InvalidClientState => StatusCode::FORBIDDEN,
                TrackerError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
                TrackerError::Store(_) | TrackerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Tracker(e) => e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = match &self {
            ApiError::BadRequest(msg) | ApiError::Forbidden(msg) => msg.clone(),
            // Internal details stay in the logs.
            ApiError::Tracker(e @ (TrackerError::Store(_) | TrackerError::Config(_))) => {
                tracing::error!("Request failed: {}", e);
                "internal error".to_string()
            }
            ApiError::Tracker(e) => e.to_string(),
        };

        (
            status,
            Json(json!({
                "success": false,
                "error": self.kind(),
                "details": details,
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
