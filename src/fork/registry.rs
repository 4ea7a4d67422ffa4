//! In-memory fork registry
//!
//! Single source of truth for fork state inside the process. Every state
//! change goes through one write-locked method so capacity checks and
//! destroy claims are atomic with respect to concurrent requests, completions
//! and reaper sweeps.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::provisioner::ProvisionedFork;
use super::types::{ForkId, ForkRecord, ForkStatus};
use crate::error::{IcarusError, Result};

/// Outcome of asking to destroy a fork
#[derive(Debug, Clone)]
pub enum DestroyClaim {
    /// Caller now owns the destroy; the record is in `destroying`
    Claimed(ForkRecord),
    /// Fork is still being created; it will be destroyed once provisioned
    Deferred,
    /// Another path already owns or finished the destroy
    AlreadyHandled(ForkStatus),
}

#[derive(Default)]
pub struct ForkRegistry {
    records: RwLock<HashMap<ForkId, ForkRecord>>,
}

impl ForkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `creating` record unless the live count is at `max_live`
    pub async fn admit(&self, record: ForkRecord, max_live: usize) -> Result<()> {
        let mut records = self.records.write().await;
        let live = records.values().filter(|r| r.is_live()).count();
        if live >= max_live {
            return Err(IcarusError::Capacity {
                live,
                max: max_live,
            });
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Insert a record reloaded from persistence, bypassing the cap
    pub async fn restore(&self, record: ForkRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &ForkId) -> Option<ForkRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ForkRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub async fn live_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.is_live())
            .count()
    }

    pub async fn counts(&self) -> BTreeMap<ForkStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.read().await.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// `creating -> active`, arming the TTL deadline from now
    pub async fn activate(&self, id: &ForkId, fork: ProvisionedFork) -> Result<ForkRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| IcarusError::ForkNotFound(id.to_string()))?;
        record.transition(ForkStatus::Active)?;

        let ttl = chrono::Duration::from_std(record.ttl)
            .map_err(|e| IcarusError::Internal(format!("ttl out of range: {}", e)))?;
        record.service_id = Some(fork.service_id);
        record.access = Some(fork.access);
        record.deadline = Some(Instant::now() + record.ttl);
        record.expires_at = Some(record.updated_at + ttl);
        Ok(record.clone())
    }

    /// Any live state -> `failed`
    pub async fn fail(&self, id: &ForkId, reason: &str) -> Result<ForkRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| IcarusError::ForkNotFound(id.to_string()))?;
        record.transition(ForkStatus::Failed)?;
        record.last_error = Some(reason.to_string());
        record.destroy_in_flight = false;
        Ok(record.clone())
    }

    pub async fn set_result(&self, id: &ForkId, result: serde_json::Value) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| IcarusError::ForkNotFound(id.to_string()))?;
        record.result = Some(result);
        Ok(())
    }

    /// Claim the destroy of one fork on behalf of a completion
    pub async fn begin_destroy(&self, id: &ForkId) -> Result<DestroyClaim> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| IcarusError::ForkNotFound(id.to_string()))?;

        match record.status {
            ForkStatus::Creating => {
                record.completion_requested = true;
                Ok(DestroyClaim::Deferred)
            }
            ForkStatus::Active => {
                record.transition(ForkStatus::Destroying)?;
                record.destroy_in_flight = true;
                Ok(DestroyClaim::Claimed(record.clone()))
            }
            ForkStatus::Destroying if !record.destroy_in_flight => {
                record.destroy_in_flight = true;
                Ok(DestroyClaim::Claimed(record.clone()))
            }
            status => Ok(DestroyClaim::AlreadyHandled(status)),
        }
    }

    /// Claim every active fork past its deadline plus every destroy awaiting
    /// retry
    pub async fn claim_expired(&self, now: Instant) -> Vec<ForkRecord> {
        let mut records = self.records.write().await;
        let mut claimed = Vec::new();
        for record in records.values_mut() {
            let due = record.is_expired(now)
                || (record.status == ForkStatus::Destroying && !record.destroy_in_flight);
            if !due {
                continue;
            }
            if record.status == ForkStatus::Active && record.transition(ForkStatus::Destroying).is_err() {
                continue;
            }
            record.destroy_in_flight = true;
            claimed.push(record.clone());
        }
        claimed
    }

    /// Claim every fork still holding a provisioned resource, used at shutdown
    pub async fn claim_all_provisioned(&self) -> Vec<ForkRecord> {
        let mut records = self.records.write().await;
        let mut claimed = Vec::new();
        for record in records.values_mut() {
            let claimable = record.status == ForkStatus::Active
                || (record.status == ForkStatus::Destroying && !record.destroy_in_flight);
            if !claimable {
                continue;
            }
            if record.status == ForkStatus::Active && record.transition(ForkStatus::Destroying).is_err() {
                continue;
            }
            record.destroy_in_flight = true;
            claimed.push(record.clone());
        }
        claimed
    }

    /// `destroying -> destroyed`
    pub async fn finish_destroy(&self, id: &ForkId) -> Result<ForkRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| IcarusError::ForkNotFound(id.to_string()))?;
        record.transition(ForkStatus::Destroyed)?;
        record.destroy_in_flight = false;
        record.last_error = None;
        Ok(record.clone())
    }

    /// Count a failed destroy attempt. Returns the updated record and whether
    /// retries are exhausted, in which case the record is now `failed`.
    pub async fn destroy_failed(
        &self,
        id: &ForkId,
        reason: &str,
        max_attempts: u32,
    ) -> Result<(ForkRecord, bool)> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| IcarusError::ForkNotFound(id.to_string()))?;
        record.destroy_attempts += 1;
        record.last_error = Some(reason.to_string());
        record.destroy_in_flight = false;

        let exhausted = record.destroy_attempts >= max_attempts;
        if exhausted {
            record.transition(ForkStatus::Failed)?;
        } else {
            record.updated_at = Utc::now();
        }
        Ok((record.clone(), exhausted))
    }

    /// Drop terminal records last updated before `cutoff`
    pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.updated_at < cutoff));
        before - records.len()
    }
}
