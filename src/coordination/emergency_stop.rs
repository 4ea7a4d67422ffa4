//! Emergency halt switch
//!
//! The halt signal must reach every holder even when the bus is saturated,
//! so it travels on a `watch` channel that always keeps the latest value.
//! A bus event is published as well, as a best-effort notification for
//! components that only listen to the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::bus::{Event, EventBus, EventPayload};
use crate::error::{IcarusError, Result};
use crate::persistence::{AuditEntry, StateStore};

const HALT_SOURCE: &str = "halt_switch";

/// Emergency halt reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyReason {
    /// Manual trigger by operator
    Manual,
    RiskLimitExceeded,
    /// Provider resources could not be released
    ResourceLeak,
    /// Urgent shutdown signal
    Signal,
    Other(String),
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyReason::Manual => write!(f, "Manual"),
            EmergencyReason::RiskLimitExceeded => write!(f, "RiskLimitExceeded"),
            EmergencyReason::ResourceLeak => write!(f, "ResourceLeak"),
            EmergencyReason::Signal => write!(f, "Signal"),
            EmergencyReason::Other(s) => write!(f, "Other: {}", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub reason: Option<EmergencyReason>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub context: Option<String>,
}

pub struct HaltSwitch {
    state: RwLock<EmergencyState>,
    tx: watch::Sender<bool>,
    bus: Option<EventBus>,
    store: Option<Arc<dyn StateStore>>,
}

impl Default for HaltSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl HaltSwitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(EmergencyState::default()),
            tx,
            bus: None,
            store: None,
        }
    }

    /// Mirror halts onto the bus
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Record triggers and resets in the audit trail
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fast check, no locking
    pub fn is_halted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Guaranteed-delivery view of the halt flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub async fn get_state(&self) -> EmergencyState {
        self.state.read().await.clone()
    }

    /// Fail with [`IcarusError::Halted`] while the switch is engaged
    pub fn check_allowed(&self) -> Result<()> {
        if self.is_halted() {
            return Err(IcarusError::Halted(
                "new work is refused until an operator resets the halt".into(),
            ));
        }
        Ok(())
    }

    pub async fn trigger(&self, reason: EmergencyReason, context: Option<String>) {
        let mut state = self.state.write().await;
        if state.active {
            warn!(
                "Emergency halt already active ({:?}), ignoring {}",
                state.reason, reason
            );
            return;
        }

        error!("EMERGENCY HALT TRIGGERED: {} - {:?}", reason, context);
        self.tx.send_replace(true);
        *state = EmergencyState {
            active: true,
            reason: Some(reason.clone()),
            triggered_at: Some(Utc::now()),
            context: context.clone(),
        };
        drop(state);

        if let Some(ref bus) = self.bus {
            bus.publish(Event::new(
                HALT_SOURCE,
                EventPayload::EmergencyHalt {
                    reason: reason.to_string(),
                    context: context.clone(),
                },
            ));
        }

        self.record(
            "triggered",
            serde_json::json!({ "reason": reason.to_string(), "context": context }),
        )
        .await;
    }

    /// Clear the halt (requires manual intervention)
    pub async fn reset(&self, operator: &str) {
        info!("Resetting emergency halt (operator: {})", operator);
        self.tx.send_replace(false);
        *self.state.write().await = EmergencyState::default();
        self.record("reset", serde_json::json!({ "operator": operator }))
            .await;
    }

    async fn record(&self, action: &str, payload: serde_json::Value) {
        if let Some(ref store) = self.store {
            if let Err(e) = store
                .append_audit(AuditEntry::new("halt", HALT_SOURCE, action, payload))
                .await
            {
                error!("Failed to persist halt state: {}", e);
            }
        }
    }
}
