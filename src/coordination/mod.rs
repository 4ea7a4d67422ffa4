//! Coordination Layer
//!
//! - Agent runtime for ordered agent startup/shutdown
//! - Emergency halt switch with guaranteed delivery
//! - Shutdown signal handling

pub mod emergency_stop;
pub mod lifecycle;
pub mod shutdown;

pub use emergency_stop::{EmergencyReason, EmergencyState, HaltSwitch};
pub use lifecycle::AgentRuntime;
pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownSignal};
