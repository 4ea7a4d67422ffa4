//! Provisioner seam
//!
//! The only boundary between the fork manager and the external database
//! platform. Every call may fail outright or end with an unknown outcome;
//! [`ProvisionError::Ambiguous`] marks the latter so the manager reconciles
//! through [`Provisioner::find`] instead of assuming either result.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::IcarusError;

/// A fork that exists on the external platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedFork {
    pub service_id: String,
    /// Connection details handed to the requester verbatim
    pub access: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// The call definitely did not take effect
    #[error("provisioning call failed: {0}")]
    Failed(String),

    /// The call may or may not have taken effect
    #[error("provisioning outcome unknown: {0}")]
    Ambiguous(String),
}

impl From<ProvisionError> for IcarusError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Failed(msg) => IcarusError::Provisioning(msg),
            ProvisionError::Ambiguous(msg) => IcarusError::ReconciliationAmbiguity(msg),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a fork of `parent_id` under the external name `name`
    async fn create(
        &self,
        parent_id: &str,
        name: &str,
    ) -> std::result::Result<ProvisionedFork, ProvisionError>;

    /// Release a fork; destroying an already-absent fork succeeds
    async fn destroy(&self, service_id: &str) -> std::result::Result<(), ProvisionError>;

    /// Look a fork up by external name
    async fn find(&self, name: &str)
        -> std::result::Result<Option<ProvisionedFork>, ProvisionError>;
}
