//! Audit recorder
//!
//! Event-driven agent that appends every bus event to the audit trail.
//! Heartbeats are skipped unless asked for.

use async_trait::async_trait;
use std::sync::Arc;

use super::store::{AuditEntry, StateStore};
use crate::agents::{AgentContext, EventHandler};
use crate::bus::{Event, EventKind};
use crate::error::Result;

pub const AUDIT_RECORDER_NAME: &str = "audit_recorder";

pub struct AuditRecorder {
    store: Arc<dyn StateStore>,
    include_heartbeats: bool,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            include_heartbeats: false,
        }
    }

    pub fn with_heartbeats(mut self, include: bool) -> Self {
        self.include_heartbeats = include;
        self
    }
}

#[async_trait]
impl EventHandler for AuditRecorder {
    fn name(&self) -> &str {
        AUDIT_RECORDER_NAME
    }

    fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|k| self.include_heartbeats || *k != EventKind::AgentHeartbeat)
            .collect()
    }

    async fn handle(&self, _ctx: &AgentContext, event: Arc<Event>) -> Result<()> {
        self.store.append_audit(AuditEntry::from_event(&event)).await
    }
}
