use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::bus::BusConfig;
use crate::fork::{ForkConfig, TsdbConfig};
use crate::persistence::DatabaseConfig;
use crate::supervisor::{AlertManagerConfig, SupervisorConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub agents: SupervisorConfig,
    #[serde(default)]
    pub forks: ForkConfig,
    #[serde(default)]
    pub provisioner: TsdbConfig,
    #[serde(default)]
    pub alerts: AlertManagerConfig,
    /// State store; in-memory when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from `config/` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config", None)
    }

    /// Load `default.toml`, then the environment file (`env`, else
    /// `$ICARUS_ENV`, else `development`), then `ICARUS_<SECTION>__<KEY>`
    /// environment variables
    pub fn load_from<P: AsRef<Path>>(config_dir: P, env: Option<&str>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env = env
            .map(str::to_string)
            .or_else(|| std::env::var("ICARUS_ENV").ok())
            .unwrap_or_else(|| "development".to_string());

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Extension is resolved by the loader, e.g. config/production.toml
            .add_source(File::from(config_dir.join(&env)).required(false))
            .add_source(
                Environment::with_prefix("ICARUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values, collecting every violation
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bus.mailbox_capacity == 0 {
            errors.push("bus.mailbox_capacity must be at least 1".to_string());
        }

        if self.agents.poll_interval_ms == 0 {
            errors.push("agents.poll_interval_ms must be positive".to_string());
        }
        if self.agents.stop_timeout_ms < self.agents.poll_interval_ms {
            errors.push(format!(
                "agents.stop_timeout_ms ({}) must be at least agents.poll_interval_ms ({})",
                self.agents.stop_timeout_ms, self.agents.poll_interval_ms
            ));
        }

        if let Err(fork_errors) = self.forks.validate() {
            errors.extend(fork_errors);
        }

        if self.provisioner.tsdb_bin.trim().is_empty() {
            errors.push("provisioner.tsdb_bin must be set".to_string());
        }

        if let Some(ref database) = self.database {
            if database.url.trim().is_empty() {
                errors.push("database.url must be set when [database] is present".to_string());
            }
            if database.max_connections == 0 {
                errors.push("database.max_connections must be at least 1".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
