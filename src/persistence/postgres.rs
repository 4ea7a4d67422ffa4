//! PostgreSQL-backed state store
//!
//! Audit rows go to `icarus_audit_log`; fork snapshots are upserted into
//! `icarus_fork_registry` keyed by fork id, with the full record kept as
//! JSONB so recovery can rebuild it without a column-per-field mapping.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use super::store::{AuditEntry, StateStore};
use crate::error::Result;
use crate::fork::ForkRecord;

/// `[database]` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        info!("Connected state store (max {} connections)", config.max_connections);
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS icarus_audit_log (
                id BIGSERIAL PRIMARY KEY,
                category TEXT NOT NULL,
                source TEXT NOT NULL,
                action TEXT NOT NULL,
                payload JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS icarus_fork_registry (
                fork_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                service_id TEXT,
                record JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO icarus_audit_log (category, source, action, payload, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.category)
        .bind(&entry.source)
        .bind(&entry.action)
        .bind(&entry.payload)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        debug!("Appended audit {}/{} from {}", entry.category, entry.action, entry.source);
        Ok(())
    }

    async fn upsert_fork(&self, record: &ForkRecord) -> Result<()> {
        let json = serde_json::to_value(record)?;
        sqlx::query(
            r#"
            INSERT INTO icarus_fork_registry (fork_id, status, service_id, record, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (fork_id) DO UPDATE SET
                status = EXCLUDED.status,
                service_id = EXCLUDED.service_id,
                record = EXCLUDED.record,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.status.as_str())
        .bind(&record.service_id)
        .bind(&json)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Upserted fork {} ({})", record.id, record.status);
        Ok(())
    }

    async fn load_forks(&self) -> Result<Vec<ForkRecord>> {
        let rows = sqlx::query("SELECT fork_id, record FROM icarus_fork_registry ORDER BY updated_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let fork_id: String = row.get("fork_id");
            let json: serde_json::Value = row.get("record");
            match serde_json::from_value::<ForkRecord>(json) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable fork snapshot {}: {}", fork_id, e),
            }
        }
        Ok(records)
    }
}
