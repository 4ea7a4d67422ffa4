//! State store seam
//!
//! Two concerns share one seam: an append-only audit trail and an upsert
//! snapshot of each fork record. Both are best-effort from the caller's
//! point of view; failures are logged and never roll back in-memory state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::bus::Event;
use crate::error::Result;
use crate::fork::{ForkId, ForkRecord};

/// One append-only audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Coarse grouping: `event`, `fork`, `halt`, `alert`
    pub category: String,
    /// Component or agent that produced the entry
    pub source: String,
    /// Fine-grained kind within the category
    pub action: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        category: impl Into<String>,
        source: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            category: category.into(),
            source: source.into(),
            action: action.into(),
            payload,
            recorded_at: Utc::now(),
        }
    }

    /// Audit row mirroring a bus event
    pub fn from_event(event: &Event) -> Self {
        let payload = serde_json::to_value(&event.payload).unwrap_or(serde_json::Value::Null);
        Self {
            category: "event".to_string(),
            source: event.source.clone(),
            action: event.kind().to_string(),
            payload,
            recorded_at: event.created_at,
        }
    }

    /// Audit row for a fork state change
    pub fn fork_transition(record: &ForkRecord) -> Self {
        Self::new(
            "fork",
            record.requester.clone(),
            record.status.to_string(),
            serde_json::json!({
                "fork_id": record.id,
                "service_id": record.service_id,
                "purpose": record.purpose,
                "destroy_attempts": record.destroy_attempts,
                "last_error": record.last_error,
            }),
        )
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()>;

    /// Insert or replace the snapshot of one fork record
    async fn upsert_fork(&self, record: &ForkRecord) -> Result<()>;

    /// Every persisted fork snapshot
    async fn load_forks(&self) -> Result<Vec<ForkRecord>>;
}

/// Process-local store, used when no database is configured and in tests
#[derive(Default)]
pub struct MemoryStore {
    audit: RwLock<Vec<AuditEntry>>,
    forks: RwLock<HashMap<ForkId, ForkRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }

    pub async fn fork(&self, id: &ForkId) -> Option<ForkRecord> {
        self.forks.read().await.get(id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn upsert_fork(&self, record: &ForkRecord) -> Result<()> {
        self.forks
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_forks(&self) -> Result<Vec<ForkRecord>> {
        Ok(self.forks.read().await.values().cloned().collect())
    }
}
