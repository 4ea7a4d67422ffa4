//! Alert Manager for operator escalation
//!
//! Every alert is logged at its level and broadcast to local subscribers.
//! Alerts worth an operator's attention are also recorded in the audit
//! trail, subject to per-key rate limiting and a global per-minute throttle
//! so a misbehaving provider cannot flood it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::persistence::{AuditEntry, StateStore};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Informational, log only
    Info,
    Warning,
    Error,
    /// Requires manual intervention
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn to_audit(&self) -> AuditEntry {
        let mut entry = AuditEntry::new(
            "alert",
            self.component.clone(),
            self.level.as_str(),
            serde_json::json!({
                "title": self.title,
                "message": self.message,
                "metadata": self.metadata,
            }),
        );
        entry.recorded_at = self.timestamp;
        entry
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Minimum interval between duplicate escalations (default: 60s)
    pub rate_limit_secs: u64,
    /// Whether info alerts are escalated (default: false)
    pub escalate_info: bool,
    /// Maximum escalations per minute before throttling (default: 10)
    pub max_alerts_per_minute: u32,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            rate_limit_secs: 60,
            escalate_info: false,
            max_alerts_per_minute: 10,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

pub struct AlertManager {
    config: AlertManagerConfig,
    store: Option<Arc<dyn StateStore>>,
    rate_limits: Arc<RwLock<HashMap<String, RateLimitState>>>,
    alerts_this_minute: Arc<RwLock<Vec<DateTime<Utc>>>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            store: None,
            rate_limits: Arc::new(RwLock::new(HashMap::new())),
            alerts_this_minute: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    /// Record escalated alerts in the audit trail
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.component, alert.level, alert.title)
    }

    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let key = Self::rate_limit_key(alert);
        let now = Utc::now();

        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return true;
            }

            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    /// Global limit on escalations per minute
    async fn is_throttled(&self) -> bool {
        let now = Utc::now();
        let minute_ago = now - chrono::Duration::minutes(1);

        let mut alerts = self.alerts_this_minute.write().await;
        alerts.retain(|t| *t > minute_ago);

        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }

        alerts.push(now);
        false
    }

    pub async fn alert(&self, alert: Alert) {
        let _ = self.event_tx.send(alert.clone());

        match alert.level {
            AlertLevel::Info => info!("[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }

        let should_escalate = match alert.level {
            AlertLevel::Info => self.config.escalate_info,
            AlertLevel::Warning | AlertLevel::Error | AlertLevel::Critical => true,
        };
        if !should_escalate {
            return;
        }

        if self.should_rate_limit(&alert).await {
            return;
        }

        if self.is_throttled().await {
            return;
        }

        if let Some(ref store) = self.store {
            if let Err(e) = store.append_audit(alert.to_audit()).await {
                error!("Failed to persist alert: {}", e);
            }
        }
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await;
    }

    /// A fork's external resource may still exist and nobody will retry
    pub async fn fork_leak(
        &self,
        fork_id: &str,
        service_id: Option<&str>,
        attempts: u32,
        last_error: &str,
    ) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "fork_manager",
                "Fork Leak Detected",
                &format!(
                    "Fork {} ({}) could not be destroyed after {} attempts: {}",
                    fork_id,
                    service_id.unwrap_or("unknown service"),
                    attempts,
                    last_error
                ),
            )
            .with_metadata(serde_json::json!({
                "action": "manual_cleanup_required",
                "fork_id": fork_id,
                "service_id": service_id,
                "attempts": attempts,
            })),
        )
        .await;
    }

    /// Provisioning outcome stayed unknown after every state query
    pub async fn reconciliation_unresolved(&self, fork_id: &str, name: &str, detail: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "fork_manager",
                "Fork State Unresolved",
                &format!(
                    "Could not determine whether {} exists for fork {}: {}",
                    name, fork_id, detail
                ),
            )
            .with_metadata(serde_json::json!({
                "action": "manual_cleanup_required",
                "fork_id": fork_id,
                "external_name": name,
            })),
        )
        .await;
    }

    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }

    pub async fn reset_rate_limits(&self) {
        let mut limits = self.rate_limits.write().await;
        limits.clear();
        debug!("Alert rate limits reset");
    }
}
