//! Supervisor Layer for agent lifecycle and operator alerts
//!
//! - Agent supervisor: drives one agent's lifecycle and reports it on the bus
//! - Alert manager: logs, broadcasts and escalates conditions needing an operator

pub mod agent_supervisor;
pub mod alert_manager;

pub use agent_supervisor::{AgentStatus, AgentSupervisor, SupervisorConfig};
pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
