//! Agents: pull-based units of work
//!
//! Each agent implements `Agent` and owns its main loop. Agents talk to
//! each other only through the bus, via their `AgentContext`.

pub mod context;
pub mod patterns;
pub mod traits;

pub use context::AgentContext;
pub use patterns::{EventDrivenAgent, EventHandler, PeriodicAgent, PeriodicTask};
pub use traits::Agent;
