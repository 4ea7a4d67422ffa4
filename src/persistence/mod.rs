//! Persistence Layer for audit trail and crash recovery
//!
//! - State store seam with in-memory and PostgreSQL implementations
//! - Audit recorder agent mirroring bus events into the audit trail

pub mod audit;
pub mod postgres;
pub mod store;

pub use audit::{AuditRecorder, AUDIT_RECORDER_NAME};
pub use postgres::{DatabaseConfig, PostgresStore};
pub use store::{AuditEntry, MemoryStore, StateStore};
