pub mod agents;
pub mod bus;
pub mod config;
pub mod coordination;
pub mod error;
pub mod fork;
pub mod persistence;
pub mod supervisor;

pub use agents::{Agent, AgentContext, EventDrivenAgent, EventHandler, PeriodicAgent, PeriodicTask};
pub use bus::{BusConfig, BusStats, Event, EventBus, EventKind, EventPayload, Mailbox, MailboxRecv};
pub use config::{AppConfig, LoggingConfig};
pub use coordination::{
    AgentRuntime, EmergencyReason, EmergencyState, GracefulShutdown, HaltSwitch, ShutdownSignal,
};
pub use error::{IcarusError, Result};
pub use fork::{
    ForkConfig, ForkId, ForkManager, ForkRecord, ForkRequest, ForkStatus, ProvisionError,
    ProvisionedFork, Provisioner, ReapReport, TsdbCliProvisioner,
};
pub use persistence::{AuditEntry, AuditRecorder, MemoryStore, PostgresStore, StateStore};
pub use supervisor::{
    AgentStatus, AgentSupervisor, Alert, AlertLevel, AlertManager, AlertManagerConfig,
    SupervisorConfig,
};
