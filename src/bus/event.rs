//! Event types carried by the bus
//!
//! Every event is an immutable record: a payload tagged by its kind plus the
//! publishing source and a creation timestamp. Subscriptions are keyed by
//! [`EventKind`], the fieldless discriminant of [`EventPayload`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable discriminant of an event payload, used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentStarted,
    AgentStopped,
    AgentError,
    AgentHeartbeat,
    ForkRequested,
    ForkCreated,
    ForkFailed,
    ForkCompleted,
    ForkDestroyed,
    ForkLeakDetected,
    EmergencyHalt,
    Custom,
}

impl EventKind {
    /// Every kind, in declaration order
    pub const ALL: [EventKind; 12] = [
        EventKind::AgentStarted,
        EventKind::AgentStopped,
        EventKind::AgentError,
        EventKind::AgentHeartbeat,
        EventKind::ForkRequested,
        EventKind::ForkCreated,
        EventKind::ForkFailed,
        EventKind::ForkCompleted,
        EventKind::ForkDestroyed,
        EventKind::ForkLeakDetected,
        EventKind::EmergencyHalt,
        EventKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentStarted => "agent_started",
            EventKind::AgentStopped => "agent_stopped",
            EventKind::AgentError => "agent_error",
            EventKind::AgentHeartbeat => "agent_heartbeat",
            EventKind::ForkRequested => "fork_requested",
            EventKind::ForkCreated => "fork_created",
            EventKind::ForkFailed => "fork_failed",
            EventKind::ForkCompleted => "fork_completed",
            EventKind::ForkDestroyed => "fork_destroyed",
            EventKind::ForkLeakDetected => "fork_leak_detected",
            EventKind::EmergencyHalt => "emergency_halt",
            EventKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Agent entered its run loop
    AgentStarted { agent: String },
    /// Agent finished finalisation; always the last event of an agent
    AgentStopped { agent: String, reason: String },
    /// Unhandled fault in an agent body
    AgentError {
        agent: String,
        error_kind: String,
        message: String,
        recoverable: bool,
    },
    /// Periodic liveness signal
    AgentHeartbeat { agent: String, status: String },
    /// Request for an ephemeral fork; `ttl_secs = None` asks for the default TTL
    ForkRequested {
        requester: String,
        purpose: String,
        ttl_secs: Option<u64>,
    },
    /// Fork provisioned and usable; `access` is an opaque descriptor
    ForkCreated {
        fork_id: String,
        service_id: String,
        requester: String,
        purpose: String,
        access: serde_json::Value,
        expires_at: DateTime<Utc>,
    },
    /// Request rejected or provisioning failed
    ForkFailed {
        fork_id: Option<String>,
        requester: String,
        purpose: String,
        reason: String,
    },
    /// Requester is done with a fork
    ForkCompleted {
        fork_id: String,
        requester: String,
        result: Option<serde_json::Value>,
    },
    /// External resource released
    ForkDestroyed {
        fork_id: String,
        service_id: Option<String>,
        requester: String,
        reason: String,
    },
    /// Destroy retries exhausted or outcome unresolvable; needs an operator
    ForkLeakDetected {
        fork_id: String,
        service_id: Option<String>,
        attempts: u32,
        last_error: String,
    },
    /// Best-effort mirror of the halt switch
    EmergencyHalt {
        reason: String,
        context: Option<String>,
    },
    /// Collaborator-defined message
    Custom {
        topic: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AgentStarted { .. } => EventKind::AgentStarted,
            EventPayload::AgentStopped { .. } => EventKind::AgentStopped,
            EventPayload::AgentError { .. } => EventKind::AgentError,
            EventPayload::AgentHeartbeat { .. } => EventKind::AgentHeartbeat,
            EventPayload::ForkRequested { .. } => EventKind::ForkRequested,
            EventPayload::ForkCreated { .. } => EventKind::ForkCreated,
            EventPayload::ForkFailed { .. } => EventKind::ForkFailed,
            EventPayload::ForkCompleted { .. } => EventKind::ForkCompleted,
            EventPayload::ForkDestroyed { .. } => EventKind::ForkDestroyed,
            EventPayload::ForkLeakDetected { .. } => EventKind::ForkLeakDetected,
            EventPayload::EmergencyHalt { .. } => EventKind::EmergencyHalt,
            EventPayload::Custom { .. } => EventKind::Custom,
        }
    }
}

/// An immutable bus event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the publishing agent or component
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            source: source.into(),
            created_at: Utc::now(),
            payload,
        }
    }

    /// Convenience constructor for collaborator-defined messages
    pub fn custom(source: impl Into<String>, topic: &str, data: serde_json::Value) -> Self {
        Self::new(
            source,
            EventPayload::Custom {
                topic: topic.to_string(),
                data,
            },
        )
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
