//! Fork domain types
//!
//! A fork record tracks one ephemeral copy of the parent database from
//! admission to destruction. Status moves forward only:
//!
//! ```text
//! creating -> active -> destroying -> destroyed
//!     \          \           \
//!      +----------+-----------+----> failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{IcarusError, Result};

/// Prefix of the external resource name derived from a fork id
pub const FORK_NAME_PREFIX: &str = "icarus-fork-";

/// Opaque fork identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(String);

impl ForkId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic name of the external resource, used to look it up
    /// again when a provisioning call has an unknown outcome
    pub fn external_name(&self) -> String {
        format!("{}{}", FORK_NAME_PREFIX, self.0)
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ForkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ForkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Fork lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkStatus {
    Creating,
    Active,
    Destroying,
    Destroyed,
    Failed,
}

impl ForkStatus {
    /// Live forks hold (or may hold) an external resource and count
    /// against the concurrency cap
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ForkStatus::Creating | ForkStatus::Active | ForkStatus::Destroying
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ForkStatus::Destroyed | ForkStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ForkStatus) -> bool {
        use ForkStatus::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Failed)
                | (Active, Destroying)
                | (Active, Failed)
                | (Destroying, Destroyed)
                | (Destroying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ForkStatus::Creating => "creating",
            ForkStatus::Active => "active",
            ForkStatus::Destroying => "destroying",
            ForkStatus::Destroyed => "destroyed",
            ForkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ForkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for a new fork
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkRequest {
    pub requester: String,
    pub purpose: String,
    pub ttl: Duration,
}

impl ForkRequest {
    pub fn new(requester: impl Into<String>, purpose: impl Into<String>, ttl: Duration) -> Self {
        Self {
            requester: requester.into(),
            purpose: purpose.into(),
            ttl,
        }
    }

    pub fn validate(&self, max_ttl: Duration) -> Result<()> {
        if self.requester.trim().is_empty() {
            return Err(IcarusError::Validation("requester must not be empty".into()));
        }
        if self.purpose.trim().is_empty() {
            return Err(IcarusError::Validation("purpose must not be empty".into()));
        }
        if self.ttl.is_zero() {
            return Err(IcarusError::Validation("ttl must be positive".into()));
        }
        if self.ttl > max_ttl {
            return Err(IcarusError::Validation(format!(
                "ttl {}s exceeds maximum {}s",
                self.ttl.as_secs(),
                max_ttl.as_secs()
            )));
        }
        Ok(())
    }
}

/// Registry entry for one fork
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRecord {
    pub id: ForkId,
    pub parent_id: String,
    /// External id, known once provisioning succeeded
    pub service_id: Option<String>,
    pub requester: String,
    pub purpose: String,
    pub status: ForkStatus,
    pub ttl: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Wall-clock expiry, set on activation
    pub expires_at: Option<DateTime<Utc>>,
    pub access: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub destroy_attempts: u32,
    pub last_error: Option<String>,
    /// Completion arrived while the fork was still being created
    pub completion_requested: bool,
    /// Monotonic expiry used by the reaper; rebuilt from `expires_at` on recovery
    #[serde(skip)]
    pub(crate) deadline: Option<Instant>,
    #[serde(skip)]
    pub(crate) destroy_in_flight: bool,
}

impl ForkRecord {
    /// New record in `creating` state
    pub fn creating(parent_id: &str, request: &ForkRequest) -> Self {
        let now = Utc::now();
        Self {
            id: ForkId::generate(),
            parent_id: parent_id.to_string(),
            service_id: None,
            requester: request.requester.clone(),
            purpose: request.purpose.clone(),
            status: ForkStatus::Creating,
            ttl: request.ttl,
            created_at: now,
            updated_at: now,
            expires_at: None,
            access: None,
            result: None,
            destroy_attempts: 0,
            last_error: None,
            completion_requested: false,
            deadline: None,
            destroy_in_flight: false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.status == ForkStatus::Active && self.deadline.map_or(false, |d| d <= now)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub(crate) fn transition(&mut self, next: ForkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(IcarusError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Rebuild the monotonic deadline after a reload from persistence
    pub(crate) fn restore_deadline(&mut self) {
        self.destroy_in_flight = false;
        self.deadline = self.expires_at.map(|expires_at| {
            let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            Instant::now() + remaining
        });
    }
}
