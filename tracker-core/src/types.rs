use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingStatus {
    Pending,
    Replied,
    Stopped,
    Expired,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::Replied => "replied",
            TrackingStatus::Stopped => "stopped",
            TrackingStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrackingStatus::Pending)
    }
}

impl FromStr for TrackingStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TrackingStatus::Pending),
            "replied" => Ok(TrackingStatus::Replied),
            "stopped" => Ok(TrackingStatus::Stopped),
            "expired" => Ok(TrackingStatus::Expired),
            other => Err(TrackerError::Store(format!("unknown tracking status '{}'", other))),
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a reply was established. `SubjectMatch` is the low-confidence fallback
/// and stays distinguishable for later audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    ConversationId,
    InReplyTo,
    SubjectMatch,
    PixelOpen,
    LinkClick,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::ConversationId => "conversation_id",
            DetectionMethod::InReplyTo => "in_reply_to",
            DetectionMethod::SubjectMatch => "subject_match",
            DetectionMethod::PixelOpen => "pixel_open",
            DetectionMethod::LinkClick => "link_click",
        }
    }

    pub fn is_high_confidence(&self) -> bool {
        matches!(self, DetectionMethod::ConversationId | DetectionMethod::InReplyTo)
    }
}

impl FromStr for DetectionMethod {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation_id" => Ok(DetectionMethod::ConversationId),
            "in_reply_to" => Ok(DetectionMethod::InReplyTo),
            "subject_match" => Ok(DetectionMethod::SubjectMatch),
            "pixel_open" => Ok(DetectionMethod::PixelOpen),
            "link_click" => Ok(DetectionMethod::LinkClick),
            other => Err(TrackerError::Store(format!("unknown detection method '{}'", other))),
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound email under observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMessage {
    pub id: Uuid,
    pub user_id: String,
    pub sender_address: String,
    pub recipient_address: String,
    pub subject: String,
    pub provider_message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub internet_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: TrackingStatus,
    pub reply_received_at: Option<DateTime<Utc>>,
    pub reply_method: Option<DetectionMethod>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl TrackedMessage {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TrackingStatus::Pending
            && self.expires_at.map_or(false, |expires| expires <= now)
    }
}

/// Everything known about a tracked message at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrackedMessage {
    pub user_id: String,
    pub sender_address: String,
    pub recipient_address: String,
    pub subject: String,
    pub provider_message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub internet_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A normalized, deduplicated message observed in a user's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessageRecord {
    pub user_id: String,
    pub provider_message_id: String,
    pub conversation_id: Option<String>,
    pub internet_message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub sender_address: String,
    pub recipient_address: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub body_preview: String,
    pub is_read: bool,
}

/// A single allowed move away from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Replied {
        at: DateTime<Utc>,
        method: DetectionMethod,
    },
    Stopped {
        at: DateTime<Utc>,
    },
    Expired,
}

impl Transition {
    pub fn target(&self) -> TrackingStatus {
        match self {
            Transition::Replied { .. } => TrackingStatus::Replied,
            Transition::Stopped { .. } => TrackingStatus::Stopped,
            Transition::Expired => TrackingStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Deleted,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "deleted" => Ok(SubscriptionStatus::Deleted),
            other => Err(TrackerError::Store(format!("unknown subscription status '{}'", other))),
        }
    }
}

/// A push-notification lease held with the mail provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub user_id: String,
    pub resource: String,
    pub change_types: String,
    pub expires_at: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

/// Process-wide operating mode. Always derived from current health, never authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    Push,
    Poll,
}

impl TrackingMode {
    pub fn from_health(webhook_healthy: bool) -> Self {
        if webhook_healthy {
            TrackingMode::Push
        } else {
            TrackingMode::Poll
        }
    }
}

/// Credential row owned by the external token service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Entry in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub tracked_email_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub event_type: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TrackingEvent {
    pub fn new(event_type: &str, detail: serde_json::Value) -> Self {
        Self {
            tracked_email_id: None,
            user_id: None,
            event_type: event_type.to_string(),
            detail,
            created_at: Utc::now(),
        }
    }

    pub fn for_tracked(mut self, id: Uuid) -> Self {
        self.tracked_email_id = Some(id);
        self
    }

    pub fn for_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
}

/// Lowercased, trimmed address with any display name removed.
pub fn normalize_address(addr: &str) -> String {
    let addr = addr.trim();
    if let (Some(start), Some(end)) = (addr.rfind('<'), addr.rfind('>')) {
        if end > start {
            return addr[start + 1..end].trim().to_lowercase();
        }
    }
    addr.to_lowercase()
}
