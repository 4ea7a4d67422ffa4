//! Ephemeral database forks
//!
//! Requesters get a short-lived copy of the parent database, use it, and
//! hand it back. The manager guarantees every fork it provisions is
//! eventually destroyed or reported as leaked.

pub mod manager;
pub mod provisioner;
pub mod registry;
pub mod tsdb;
pub mod types;

pub use manager::{ForkConfig, ForkManager, ForkManagerBuilder, ReapReport, FORK_MANAGER_NAME};
pub use provisioner::{ProvisionError, ProvisionedFork, Provisioner};
pub use registry::{DestroyClaim, ForkRegistry};
pub use tsdb::{TsdbCliProvisioner, TsdbConfig};
pub use types::{ForkId, ForkRecord, ForkRequest, ForkStatus, FORK_NAME_PREFIX};
