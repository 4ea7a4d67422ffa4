//! Provisioner backed by the Tiger Cloud `tsdb` CLI
//!
//! Each call shells out to `tsdb service ...` and parses its JSON output.
//! Timeouts are applied by the caller; the child process is killed when the
//! call future is dropped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use super::provisioner::{ProvisionError, ProvisionedFork, Provisioner};

const DEFAULT_PORT: u64 = 5432;
const DEFAULT_DATABASE: &str = "tsdb";
const DEFAULT_USERNAME: &str = "tsdbadmin";

/// `[provisioner]` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsdbConfig {
    /// Path or name of the CLI binary
    pub tsdb_bin: String,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            tsdb_bin: "tsdb".to_string(),
        }
    }
}

pub struct TsdbCliProvisioner {
    bin: String,
}

impl TsdbCliProvisioner {
    pub fn new(config: &TsdbConfig) -> Self {
        Self {
            bin: config.tsdb_bin.clone(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, ProvisionError> {
        debug!("Running {} {}", self.bin, args.join(" "));
        let output = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProvisionError::Failed(format!("failed to spawn {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProvisionError::Failed(format!(
                "{} {} exited with {}: {}",
                self.bin,
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr
            )));
        }
        Ok(output.stdout)
    }

    async fn describe(&self, service_id: &str) -> Result<ProvisionedFork, ProvisionError> {
        let stdout = self.run(&["service", "show", service_id]).await?;
        let info: Value = serde_json::from_slice(&stdout)
            .map_err(|e| ProvisionError::Failed(format!("unparseable service info: {}", e)))?;
        Ok(ProvisionedFork {
            service_id: service_id.to_string(),
            access: access_from_service(&info, service_id),
        })
    }
}

#[async_trait]
impl Provisioner for TsdbCliProvisioner {
    async fn create(&self, parent_id: &str, name: &str) -> Result<ProvisionedFork, ProvisionError> {
        let stdout = self
            .run(&["service", "fork", parent_id, "--name", name])
            .await?;

        // The fork exists once the CLI exits zero; anything unreadable after
        // that point leaves its id unknown.
        let output: Value = serde_json::from_slice(&stdout).map_err(|e| {
            ProvisionError::Ambiguous(format!("fork output for {} unreadable: {}", name, e))
        })?;
        let service_id = service_id_of(&output).ok_or_else(|| {
            ProvisionError::Ambiguous(format!("fork output for {} has no service_id", name))
        })?;

        self.describe(&service_id).await.map_err(|e| {
            ProvisionError::Ambiguous(format!("fork {} created but not described: {}", service_id, e))
        })
    }

    async fn destroy(&self, service_id: &str) -> Result<(), ProvisionError> {
        match self.run(&["service", "delete", service_id, "--force"]).await {
            Ok(_) => Ok(()),
            Err(ProvisionError::Failed(msg)) if is_not_found(&msg) => {
                warn!("Fork {} already absent: {}", service_id, msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn find(&self, name: &str) -> Result<Option<ProvisionedFork>, ProvisionError> {
        let stdout = self.run(&["service", "list"]).await?;
        let listing: Value = serde_json::from_slice(&stdout)
            .map_err(|e| ProvisionError::Failed(format!("unparseable service list: {}", e)))?;

        match find_in_listing(&listing, name) {
            Some(service_id) => self.describe(&service_id).await.map(Some),
            None => Ok(None),
        }
    }
}

fn service_id_of(value: &Value) -> Option<String> {
    value
        .get("service_id")
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn access_from_service(info: &Value, service_id: &str) -> Value {
    json!({
        "host": info.get("host").cloned().unwrap_or(Value::Null),
        "port": info.get("port").and_then(Value::as_u64).unwrap_or(DEFAULT_PORT),
        "database": info.get("database").and_then(Value::as_str).unwrap_or(DEFAULT_DATABASE),
        "username": info.get("username").and_then(Value::as_str).unwrap_or(DEFAULT_USERNAME),
        "service_id": service_id,
    })
}

/// Service id of the entry named `name` in a `service list` document
fn find_in_listing(listing: &Value, name: &str) -> Option<String> {
    let services = listing
        .as_array()
        .or_else(|| listing.get("services").and_then(Value::as_array))?;
    services
        .iter()
        .find(|s| s.get("name").and_then(Value::as_str) == Some(name))
        .and_then(service_id_of)
}

fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") || lower.contains("does not exist")
}
