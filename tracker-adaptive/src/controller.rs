//! Push/poll mode selection.
//!
//! The mode is a judgment recomputed from configuration, a reachability check
//! and the persisted subscriptions on every check. The in-memory state only
//! caches the last judgment; any instance can rebuild it with [`ModeController::check_health`].

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use tracker_core::{Result, TrackerContext, TrackerError, TrackingMode};
use tracker_replies::SyncReport;

const PROBE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub mode: TrackingMode,
    pub webhook_url: Option<String>,
    pub active_subscriptions: Option<i64>,
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
    pub sync_interval_minutes: i64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone)]
struct ControllerState {
    mode: TrackingMode,
    webhook_healthy: bool,
    last_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_sync: Option<DateTime<Utc>>,
    paused_users: BTreeSet<String>,
    last_report: Option<HealthReport>,
}

impl Default for ControllerState {
    fn default() -> Self {
        // Nothing is proven yet; poll until a check says otherwise.
        ControllerState {
            mode: TrackingMode::Poll,
            webhook_healthy: false,
            last_check: None,
            consecutive_failures: 0,
            last_sync: None,
            paused_users: BTreeSet::new(),
            last_report: None,
        }
    }
}

pub struct ModeController {
    ctx: TrackerContext,
    client: Arc<reqwest::Client>,
    state: RwLock<ControllerState>,
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1"))
}

impl ModeController {
    pub fn new(ctx: TrackerContext) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            ctx,
            client: Arc::new(client),
            state: RwLock::new(ControllerState::default()),
        })
    }

    pub async fn mode(&self) -> TrackingMode {
        self.state.read().await.mode
    }

    /// Cadence of the reply sync sweep for a given mode: frequent while
    /// polling, a daily backstop while push is healthy.
    pub fn sync_interval(&self, mode: TrackingMode) -> Duration {
        let tracking = &self.ctx.config.tracking;
        match mode {
            TrackingMode::Poll => Duration::minutes(tracking.poll_sync_interval_minutes as i64),
            TrackingMode::Push => Duration::hours(tracking.backstop_sync_interval_hours as i64),
        }
    }

    /// Checks the webhook configuration and shape. Returns the parsed URL, or
    /// the reasons it cannot be used.
    fn validate_config(&self) -> std::result::Result<Url, Vec<String>> {
        let config = &self.ctx.config;
        let mut problems = Vec::new();

        if config.provider.client_state.is_none() {
            problems.push("Set WEBHOOK_CLIENT_STATE so push notifications can be verified".to_string());
        }
        if config.provider.client_id.is_none() {
            problems.push("Set GRAPH_CLIENT_ID to enable provider subscriptions".to_string());
        }

        let url = match config.webhook_url() {
            None => {
                problems.push("Set PUBLIC_BASE_URL to receive push notifications".to_string());
                None
            }
            Some(raw) => match Url::parse(&raw) {
                Ok(url) if url.scheme() == "https" || (url.scheme() == "http" && is_loopback(&url)) => Some(url),
                Ok(_) => {
                    problems.push(format!("Webhook URL {} must use https", raw));
                    None
                }
                Err(e) => {
                    problems.push(format!("Webhook URL {} is invalid: {}", raw, e));
                    None
                }
            },
        };

        match url {
            Some(url) if problems.is_empty() => Ok(url),
            _ => Err(problems),
        }
    }

    /// Sends the same validation handshake the provider uses and expects the
    /// token echoed back.
    async fn check_reachable(&self, url: &Url) -> std::result::Result<(), String> {
        let token = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(url.clone())
            .query(&[("validationToken", token.as_str())])
            .send()
            .await
            .map_err(|e| format!("Webhook check failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("Webhook check returned {}", status));
        }
        let body = response
            .text()
            .await
            .map_err(|e| format!("Webhook check body unreadable: {}", e))?;
        if body.trim() != token {
            return Err("Webhook check did not echo the validation token".to_string());
        }
        Ok(())
    }

    /// Recomputes webhook health and the resulting mode. Safe to call from
    /// any number of instances at once.
    pub async fn check_health(&self) -> HealthReport {
        let now = Utc::now();
        let mut recommendations = Vec::new();

        let healthy = match self.validate_config() {
            Err(problems) => {
                recommendations.extend(problems);
                false
            }
            Ok(_) if self.ctx.config.tracking.serverless => true,
            Ok(url) => match self.check_reachable(&url).await {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!("{}", reason);
                    recommendations.push(reason);
                    false
                }
            },
        };

        let active_subscriptions = match self.ctx.store.count_active_subscriptions(now).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::error!("Failed to count active subscriptions: {}", e);
                None
            }
        };
        if active_subscriptions == Some(0) {
            recommendations.push("No active push subscriptions; create one per connected mailbox".to_string());
        }

        let mode = TrackingMode::from_health(healthy);
        let mut state = self.state.write().await;
        for user in &state.paused_users {
            recommendations.push(format!("User {} must reconnect their mailbox", user));
        }

        if state.last_check.is_some() && state.webhook_healthy != healthy {
            if healthy {
                tracing::info!("Webhook recovered; switching to push with a backstop sync");
            } else {
                tracing::warn!("Webhook unhealthy; switching to poll mode");
            }
        }
        state.webhook_healthy = healthy;
        state.mode = mode;
        state.last_check = Some(now);
        state.consecutive_failures = if healthy { 0 } else { state.consecutive_failures + 1 };

        let report = HealthReport {
            healthy,
            mode,
            webhook_url: self.ctx.config.webhook_url(),
            active_subscriptions,
            consecutive_failures: state.consecutive_failures,
            last_check: now,
            sync_interval_minutes: self.sync_interval(mode).num_minutes(),
            recommendations,
        };
        state.last_report = Some(report.clone());
        report
    }

    /// The last computed report, or a fresh one if none exists yet.
    pub async fn status(&self) -> HealthReport {
        if let Some(report) = self.state.read().await.last_report.clone() {
            return report;
        }
        self.check_health().await
    }

    pub async fn sync_due(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read().await;
        match state.last_sync {
            None => true,
            Some(last) => now - last >= self.sync_interval(state.mode),
        }
    }

    /// Remembers the outcome of a sync sweep: when it ran and whose mailbox
    /// needs reconnecting.
    pub async fn record_sync(&self, report: &SyncReport, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.last_sync = Some(at);
        state.paused_users = report.paused_users.iter().cloned().collect();
    }
}
