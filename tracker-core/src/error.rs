use thiserror::Error;

/// Failure taxonomy shared by every tracking component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The user's mail credential is missing, expired or revoked.
    #[error("reconnect required for user {user_id}")]
    AuthRequired { user_id: String },

    /// The provider refused the request (scope, quota, malformed request).
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),

    /// A referenced provider or local resource no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// A push notification failed the shared-secret check.
    #[error("invalid client state on push notification")]
    InvalidClientState,

    /// Timeout, connection failure or provider 5xx. Retried by the next sweep.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("malformed signal: {0}")]
    MalformedSignal(String),

    /// A tracked message already has a different conversation id.
    #[error("conversation id conflict on {tracked_id}: stored {stored}, got {incoming}")]
    ConversationConflict {
        tracked_id: String,
        stored: String,
        incoming: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    /// Whether a later sweep may succeed without any outside intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::TransientNetwork(_) | TrackerError::Store(_))
    }

    /// Stable machine-readable name, used in API payloads and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::AuthRequired { .. } => "auth_required",
            TrackerError::ProviderRejected(_) => "provider_rejected",
            TrackerError::NotFound(_) => "not_found",
            TrackerError::InvalidClientState => "invalid_client_state",
            TrackerError::TransientNetwork(_) => "transient_network",
            TrackerError::MalformedSignal(_) => "malformed_signal",
            TrackerError::ConversationConflict { .. } => "conversation_conflict",
            TrackerError::Store(_) => "store",
            TrackerError::Config(_) => "config",
        }
    }
}

impl From<diesel::result::Error> for TrackerError {
    fn from(e: diesel::result::Error) -> Self {
        TrackerError::Store(e.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for TrackerError {
    fn from(e: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        TrackerError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TrackerError::MalformedSignal(e.to_string())
        } else {
            TrackerError::TransientNetwork(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
