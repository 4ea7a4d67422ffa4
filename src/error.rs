use thiserror::Error;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum IcarusError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Request errors (returned synchronously to the caller)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Capacity exhausted: {live} live forks, maximum {max}")]
    Capacity { live: usize, max: usize },

    // Fork lifecycle errors
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Provisioning outcome ambiguous: {0}")]
    ReconciliationAmbiguity(String),

    #[error("Destroy failed for fork {fork_id}: {reason}")]
    Destroy { fork_id: String, reason: String },

    #[error("Fork not found: {0}")]
    ForkNotFound(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Bus and agent errors
    #[error("Event bus is closed")]
    BusClosed,

    #[error("Agent {agent} panicked: {message}")]
    AgentPanicked { agent: String, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Emergency halt active: {0}")]
    Halted(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IcarusError {
    /// Stable classification carried by agent error events
    pub fn kind(&self) -> &'static str {
        match self {
            IcarusError::Config(_) => "config",
            IcarusError::Database(_) => "database",
            IcarusError::Json(_) => "json",
            IcarusError::Validation(_) => "validation",
            IcarusError::Capacity { .. } => "capacity",
            IcarusError::Provisioning(_) => "provisioning",
            IcarusError::ReconciliationAmbiguity(_) => "reconciliation_ambiguity",
            IcarusError::Destroy { .. } => "destroy",
            IcarusError::ForkNotFound(_) => "fork_not_found",
            IcarusError::InvalidStateTransition { .. } => "invalid_state_transition",
            IcarusError::BusClosed => "bus_closed",
            IcarusError::AgentPanicked { .. } => "panic",
            IcarusError::Timeout(_) => "timeout",
            IcarusError::Halted(_) => "halted",
            IcarusError::ShuttingDown(_) => "shutting_down",
            IcarusError::Io(_) => "io",
            IcarusError::Internal(_) => "internal",
            IcarusError::Other(_) => "other",
        }
    }

    /// Whether retrying the failed operation later can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IcarusError::Database(_)
                | IcarusError::Capacity { .. }
                | IcarusError::Provisioning(_)
                | IcarusError::ReconciliationAmbiguity(_)
                | IcarusError::Destroy { .. }
                | IcarusError::Timeout(_)
                | IcarusError::Halted(_)
                | IcarusError::Io(_)
        )
    }
}

/// Result type alias for IcarusError
pub type Result<T> = std::result::Result<T, IcarusError>;
