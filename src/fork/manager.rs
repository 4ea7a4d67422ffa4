//! Fork manager
//!
//! Orchestrates ephemeral database forks: admits requests under a
//! concurrency cap, provisions through the [`Provisioner`], reconciles
//! calls with unknown outcomes, destroys forks on completion or TTL expiry,
//! and escalates resources it cannot release.
//!
//! Slow provider calls never run on the agent loop. Each one is spawned onto
//! a tracked task set, so the loop keeps reacting to requests and stops
//! within one poll interval. The set is drained on shutdown.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::provisioner::{ProvisionError, ProvisionedFork, Provisioner};
use super::registry::{DestroyClaim, ForkRegistry};
use super::types::{ForkId, ForkRecord, ForkRequest, ForkStatus};
use crate::agents::{Agent, AgentContext};
use crate::bus::{Event, EventBus, EventKind, EventPayload};
use crate::coordination::HaltSwitch;
use crate::error::{IcarusError, Result};
use crate::persistence::{AuditEntry, MemoryStore, StateStore};
use crate::supervisor::AlertManager;

pub const FORK_MANAGER_NAME: &str = "fork_manager";

/// `[forks]` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Service every fork is copied from
    pub parent_service_id: String,
    /// Cap on creating + active + destroying forks (default: 10)
    pub max_concurrent_forks: usize,
    /// TTL for requests that do not name one (default: 1h)
    pub default_ttl_secs: u64,
    /// Longest TTL a request may ask for (default: 4h)
    pub max_ttl_secs: u64,
    /// Reaper sweep period (default: 30s)
    pub reaper_interval_secs: u64,
    /// Destroy attempts before a fork is declared leaked (default: 3)
    pub max_destroy_attempts: u32,
    pub provision_timeout_secs: u64,
    pub destroy_timeout_secs: u64,
    /// Timeout of one reconciliation state query (default: 30s)
    pub query_timeout_secs: u64,
    /// State queries before an unknown outcome is given up on (default: 3)
    pub reconcile_attempts: u32,
    /// How long destroyed and failed records stay visible (default: 1h)
    pub terminal_retention_secs: u64,
    /// Destroy every provisioned fork when the manager stops (default: true)
    pub destroy_on_shutdown: bool,
    /// Time in-flight provider calls get to finish on shutdown (default: 30s)
    pub shutdown_drain_secs: u64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            parent_service_id: String::new(),
            max_concurrent_forks: 10,
            default_ttl_secs: 3600,
            max_ttl_secs: 4 * 3600,
            reaper_interval_secs: 30,
            max_destroy_attempts: 3,
            provision_timeout_secs: 300,
            destroy_timeout_secs: 120,
            query_timeout_secs: 30,
            reconcile_attempts: 3,
            terminal_retention_secs: 3600,
            destroy_on_shutdown: true,
            shutdown_drain_secs: 30,
        }
    }
}

impl ForkConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    fn terminal_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.terminal_retention_secs.min(i64::MAX as u64) as i64)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.parent_service_id.trim().is_empty() {
            errors.push("forks.parent_service_id must be set".to_string());
        }
        if self.max_concurrent_forks == 0 {
            errors.push("forks.max_concurrent_forks must be at least 1".to_string());
        }
        if self.default_ttl_secs == 0 {
            errors.push("forks.default_ttl_secs must be positive".to_string());
        }
        if self.default_ttl_secs > self.max_ttl_secs {
            errors.push(format!(
                "forks.default_ttl_secs ({}) exceeds forks.max_ttl_secs ({})",
                self.default_ttl_secs, self.max_ttl_secs
            ));
        }
        if self.max_destroy_attempts == 0 {
            errors.push("forks.max_destroy_attempts must be at least 1".to_string());
        }
        if self.reconcile_attempts == 0 {
            errors.push("forks.reconcile_attempts must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Outcome of one reaper sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Active forks found past their TTL
    pub expired: usize,
    /// Earlier failed destroys tried again
    pub retried: usize,
    pub destroyed: usize,
    pub failed: usize,
    /// Terminal records dropped after the retention window
    pub purged: usize,
}

struct ManagerInner {
    config: ForkConfig,
    bus: EventBus,
    provisioner: Arc<dyn Provisioner>,
    store: Arc<dyn StateStore>,
    alerts: Arc<AlertManager>,
    halt: Option<Arc<HaltSwitch>>,
    registry: ForkRegistry,
    pending: Mutex<JoinSet<()>>,
    accepting: AtomicBool,
    /// Set once shutdown has released everything; later events are dropped
    stopped: AtomicBool,
}

pub struct ForkManagerBuilder {
    config: ForkConfig,
    bus: EventBus,
    provisioner: Arc<dyn Provisioner>,
    store: Option<Arc<dyn StateStore>>,
    alerts: Option<Arc<AlertManager>>,
    halt: Option<Arc<HaltSwitch>>,
}

impl ForkManagerBuilder {
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Refuse new requests while the switch is engaged
    pub fn halt_switch(mut self, halt: Arc<HaltSwitch>) -> Self {
        self.halt = Some(halt);
        self
    }

    pub fn build(self) -> ForkManager {
        ForkManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                bus: self.bus,
                provisioner: self.provisioner,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                alerts: self
                    .alerts
                    .unwrap_or_else(|| Arc::new(AlertManager::with_defaults())),
                halt: self.halt,
                registry: ForkRegistry::new(),
                pending: Mutex::new(JoinSet::new()),
                accepting: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }
}

#[derive(Clone)]
pub struct ForkManager {
    inner: Arc<ManagerInner>,
}

impl ForkManager {
    pub fn builder(
        config: ForkConfig,
        bus: EventBus,
        provisioner: Arc<dyn Provisioner>,
    ) -> ForkManagerBuilder {
        ForkManagerBuilder {
            config,
            bus,
            provisioner,
            store: None,
            alerts: None,
            halt: None,
        }
    }

    pub fn config(&self) -> &ForkConfig {
        &self.inner.config
    }

    pub async fn get(&self, id: &ForkId) -> Option<ForkRecord> {
        self.inner.registry.get(id).await
    }

    /// Every known fork, oldest first
    pub async fn forks(&self) -> Vec<ForkRecord> {
        self.inner.registry.snapshot().await
    }

    pub async fn live_count(&self) -> usize {
        self.inner.registry.live_count().await
    }

    /// Admit a fork request and start provisioning it in the background.
    ///
    /// Rejections (validation, capacity, halt, shutdown) are returned to the
    /// caller and create no record. The fork is announced with a
    /// `ForkCreated` or `ForkFailed` event once provisioning settles.
    pub async fn request(&self, request: ForkRequest) -> Result<ForkId> {
        let inner = &self.inner;
        request.validate(inner.config.max_ttl())?;

        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(IcarusError::ShuttingDown(
                "fork manager is not accepting requests".into(),
            ));
        }
        if let Some(ref halt) = inner.halt {
            halt.check_allowed()?;
        }

        let record = ForkRecord::creating(&inner.config.parent_service_id, &request);
        let id = record.id.clone();
        if let Err(e) = inner
            .registry
            .admit(record.clone(), inner.config.max_concurrent_forks)
            .await
        {
            warn!(
                "Rejecting fork request from {} ({}): {}",
                request.requester, request.purpose, e
            );
            return Err(e);
        }

        info!(
            "Fork {} requested by {} for {} (TTL {}s)",
            id,
            request.requester,
            request.purpose,
            request.ttl.as_secs()
        );
        self.persist(&record).await;

        let manager = self.clone();
        let fork_id = id.clone();
        self.track(async move { manager.provision(fork_id).await })
            .await;
        Ok(id)
    }

    /// Release a fork the requester no longer needs.
    ///
    /// Idempotent: completing a fork that is already being destroyed or is
    /// gone is a no-op. Completing a fork still being created defers the
    /// destroy until provisioning finishes.
    pub async fn complete(&self, id: &ForkId) -> Result<()> {
        self.release(id, "completed").await
    }

    /// Like [`complete`](Self::complete), recording the requester's result
    pub async fn complete_with_result(&self, id: &ForkId, result: serde_json::Value) -> Result<()> {
        self.inner.registry.set_result(id, result).await?;
        self.release(id, "completed").await
    }

    async fn release(&self, id: &ForkId, reason: &str) -> Result<()> {
        match self.inner.registry.begin_destroy(id).await? {
            DestroyClaim::Claimed(record) => self.destroy(record, reason).await,
            DestroyClaim::Deferred => {
                info!("Fork {} still creating, destroy deferred until provisioned", id);
                Ok(())
            }
            DestroyClaim::AlreadyHandled(status) => {
                debug!("Fork {} already {}, nothing to release", id, status);
                Ok(())
            }
        }
    }

    /// Destroy every expired fork and retry destroys that failed earlier,
    /// waiting for all of them to settle
    pub async fn reap_expired(&self) -> ReapReport {
        let (claims, mut report) = self.claim_due().await;
        let destroys = claims
            .into_iter()
            .map(|(record, reason)| self.destroy(record, reason));
        for outcome in join_all(destroys).await {
            match outcome {
                Ok(()) => report.destroyed += 1,
                Err(_) => report.failed += 1,
            }
        }
        report.purged = self.purge_expired_terminal().await;
        log_sweep(&report);
        report
    }

    /// One reaper tick: claim what is due and hand each destroy to its own
    /// task, so a slow provider call never holds up the next sweep
    async fn sweep(&self) {
        let (claims, mut report) = self.claim_due().await;
        for (record, reason) in claims {
            let manager = self.clone();
            self.track(async move {
                let id = record.id.clone();
                if let Err(e) = manager.destroy(record, reason).await {
                    debug!("Reaper destroy of fork {} did not finish: {}", id, e);
                }
            })
            .await;
        }
        report.purged = self.purge_expired_terminal().await;
        log_sweep(&report);
    }

    async fn claim_due(&self) -> (Vec<(ForkRecord, &'static str)>, ReapReport) {
        let claims = self.inner.registry.claim_expired(Instant::now()).await;
        let mut report = ReapReport::default();
        let claims = claims
            .into_iter()
            .map(|record| {
                let reason = if record.destroy_attempts == 0 {
                    report.expired += 1;
                    info!(
                        "Fork {} expired (TTL {}s), destroying",
                        record.id,
                        record.ttl.as_secs()
                    );
                    "ttl_expired"
                } else {
                    report.retried += 1;
                    "destroy_retry"
                };
                (record, reason)
            })
            .collect();
        (claims, report)
    }

    async fn purge_expired_terminal(&self) -> usize {
        let inner = &self.inner;
        inner
            .registry
            .purge_terminal(Utc::now() - inner.config.terminal_retention())
            .await
    }

    /// Reload live forks from the store after a restart.
    ///
    /// Active forks keep their original wall-clock expiry. Forks caught
    /// mid-creation are reconciled against the provider in the background.
    pub async fn recover(&self) -> Result<usize> {
        let records = self.inner.store.load_forks().await?;
        let mut restored = 0;
        for mut record in records.into_iter().filter(ForkRecord::is_live) {
            record.restore_deadline();
            let id = record.id.clone();
            let creating = record.status == ForkStatus::Creating;
            self.inner.registry.restore(record).await;
            restored += 1;

            if creating {
                let manager = self.clone();
                self.track(async move { manager.resume_creating(id).await })
                    .await;
            }
        }
        if restored > 0 {
            info!("Recovered {} live fork(s) from the state store", restored);
        }
        Ok(restored)
    }

    /// Stop accepting requests, drain in-flight work, then release every
    /// provisioned fork if configured to
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);

        let mut pending = std::mem::take(&mut *inner.pending.lock().await);
        let drain = Duration::from_secs(inner.config.shutdown_drain_secs);
        let drained = timeout(drain, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {} fork task(s) still running after {}s",
                pending.len(),
                inner.config.shutdown_drain_secs
            );
            pending.shutdown().await;
        }

        if inner.config.destroy_on_shutdown {
            let claims = inner.registry.claim_all_provisioned().await;
            if !claims.is_empty() {
                info!("Stopping Fork Manager, cleaning up {} fork(s)", claims.len());
                join_all(claims.into_iter().map(|r| self.destroy(r, "shutdown"))).await;
            }
        }
        inner.stopped.store(true, Ordering::SeqCst);
    }

    async fn track<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.inner.pending.lock().await;
        while let Some(finished) = pending.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Fork task panicked: {}", e);
                }
            }
        }
        pending.spawn(task);
    }

    async fn provision(&self, id: ForkId) {
        let inner = &self.inner;
        let name = id.external_name();
        debug!(
            "Provisioning fork {} as {} from {}",
            id, name, inner.config.parent_service_id
        );

        let call = inner
            .provisioner
            .create(&inner.config.parent_service_id, &name);
        let outcome = match timeout(inner.config.provision_timeout(), call).await {
            Ok(Ok(fork)) => Ok(fork),
            Ok(Err(ProvisionError::Ambiguous(detail))) => {
                warn!("Create of fork {} has unknown outcome: {}", id, detail);
                self.reconcile_create(&name).await
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Create of fork {} timed out after {}s",
                    id, inner.config.provision_timeout_secs
                );
                self.reconcile_create(&name).await
            }
        };

        match outcome {
            Ok(fork) => self.activate(&id, fork).await,
            Err(ProvisionError::Ambiguous(detail)) => {
                self.fail(&id, &format!("provisioning outcome unresolved: {}", detail))
                    .await;
                inner
                    .alerts
                    .reconciliation_unresolved(id.as_str(), &name, &detail)
                    .await;
            }
            Err(ProvisionError::Failed(reason)) => self.fail(&id, &reason).await,
        }
    }

    async fn resume_creating(&self, id: ForkId) {
        let name = id.external_name();
        match self.query(&name).await {
            Ok(Some(fork)) => self.activate(&id, fork).await,
            Ok(None) => {
                self.fail(&id, "fork not found after restart").await;
            }
            Err(e) => {
                self.fail(&id, &e.to_string()).await;
                self.inner
                    .alerts
                    .reconciliation_unresolved(id.as_str(), &name, &e.to_string())
                    .await;
            }
        }
    }

    async fn reconcile_create(
        &self,
        name: &str,
    ) -> std::result::Result<ProvisionedFork, ProvisionError> {
        match self.query(name).await? {
            Some(fork) => {
                info!("Reconciled {}: fork exists as {}", name, fork.service_id);
                Ok(fork)
            }
            None => Err(ProvisionError::Failed(format!(
                "{} does not exist after a create with unknown outcome",
                name
            ))),
        }
    }

    async fn reconcile_destroy(&self, name: &str) -> std::result::Result<(), ProvisionError> {
        match self.query(name).await? {
            None => {
                info!("Reconciled {}: fork is gone", name);
                Ok(())
            }
            Some(fork) => Err(ProvisionError::Failed(format!(
                "{} still exists as {}",
                name, fork.service_id
            ))),
        }
    }

    /// Bounded state query; `Ambiguous` when every attempt failed
    async fn query(
        &self,
        name: &str,
    ) -> std::result::Result<Option<ProvisionedFork>, ProvisionError> {
        let inner = &self.inner;
        let attempts = inner.config.reconcile_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match timeout(inner.config.query_timeout(), inner.provisioner.find(name)).await {
                Ok(Ok(found)) => return Ok(found),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "state query timed out after {}s",
                        inner.config.query_timeout_secs
                    )
                }
            }
            warn!(
                "State query {}/{} for {} failed: {}",
                attempt, attempts, name, last_error
            );
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }
        }

        Err(ProvisionError::Ambiguous(format!(
            "state of {} unknown after {} queries: {}",
            name, attempts, last_error
        )))
    }

    async fn activate(&self, id: &ForkId, fork: ProvisionedFork) {
        let inner = &self.inner;
        let record = match inner.registry.activate(id, fork.clone()).await {
            Ok(record) => record,
            Err(e) => {
                // Nobody tracks this resource any more; release it right away
                error!(
                    "Cannot activate fork {}: {}; destroying {}",
                    id, e, fork.service_id
                );
                if let Err(e) = self
                    .destroy_external(&fork.service_id, &id.external_name())
                    .await
                {
                    inner
                        .alerts
                        .fork_leak(id.as_str(), Some(&fork.service_id), 1, &e.to_string())
                        .await;
                }
                return;
            }
        };

        info!(
            "Fork {} created as {} for {}",
            id, fork.service_id, record.requester
        );
        self.persist(&record).await;
        self.publish(EventPayload::ForkCreated {
            fork_id: id.to_string(),
            service_id: fork.service_id,
            requester: record.requester.clone(),
            purpose: record.purpose.clone(),
            access: fork.access,
            expires_at: record.expires_at.unwrap_or(record.updated_at),
        });

        if record.completion_requested {
            info!("Fork {} was completed while creating, destroying", id);
            if let Err(e) = self.release(id, "completed").await {
                warn!("Deferred destroy of fork {} failed: {}", id, e);
            }
        }
    }

    async fn fail(&self, id: &ForkId, reason: &str) {
        match self.inner.registry.fail(id, reason).await {
            Ok(record) => {
                warn!("Fork {} failed: {}", id, reason);
                self.persist(&record).await;
                self.publish(EventPayload::ForkFailed {
                    fork_id: Some(id.to_string()),
                    requester: record.requester,
                    purpose: record.purpose,
                    reason: reason.to_string(),
                });
            }
            Err(e) => warn!("Cannot mark fork {} failed: {}", id, e),
        }
    }

    /// Destroy a claimed fork. Counts a failed attempt against the retry
    /// budget and escalates once it is exhausted.
    async fn destroy(&self, record: ForkRecord, reason: &str) -> Result<()> {
        let inner = &self.inner;
        let outcome = match record.service_id.as_deref() {
            Some(service_id) => {
                self.destroy_external(service_id, &record.id.external_name())
                    .await
            }
            // Never provisioned; only the name can locate it
            None => self.reconcile_destroy(&record.id.external_name()).await,
        };

        match outcome {
            Ok(()) => {
                let record = inner.registry.finish_destroy(&record.id).await?;
                info!("Fork {} destroyed ({})", record.id, reason);
                self.persist(&record).await;
                self.publish(EventPayload::ForkDestroyed {
                    fork_id: record.id.to_string(),
                    service_id: record.service_id.clone(),
                    requester: record.requester.clone(),
                    reason: reason.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let (record, exhausted) = inner
                    .registry
                    .destroy_failed(&record.id, &message, inner.config.max_destroy_attempts)
                    .await?;
                self.persist(&record).await;

                if exhausted {
                    error!(
                        "Fork {} leaked after {} destroy attempts: {}",
                        record.id, record.destroy_attempts, message
                    );
                    self.publish(EventPayload::ForkLeakDetected {
                        fork_id: record.id.to_string(),
                        service_id: record.service_id.clone(),
                        attempts: record.destroy_attempts,
                        last_error: message.clone(),
                    });
                    inner
                        .alerts
                        .fork_leak(
                            record.id.as_str(),
                            record.service_id.as_deref(),
                            record.destroy_attempts,
                            &message,
                        )
                        .await;
                } else {
                    warn!(
                        "Destroy of fork {} failed (attempt {}/{}), retrying on next sweep: {}",
                        record.id,
                        record.destroy_attempts,
                        inner.config.max_destroy_attempts,
                        message
                    );
                }

                Err(IcarusError::Destroy {
                    fork_id: record.id.to_string(),
                    reason: message,
                })
            }
        }
    }

    async fn destroy_external(
        &self,
        service_id: &str,
        name: &str,
    ) -> std::result::Result<(), ProvisionError> {
        let inner = &self.inner;
        match timeout(inner.config.destroy_timeout(), inner.provisioner.destroy(service_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ProvisionError::Ambiguous(detail))) => {
                warn!("Destroy of {} has unknown outcome: {}", service_id, detail);
                self.reconcile_destroy(name).await
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Destroy of {} timed out after {}s",
                    service_id, inner.config.destroy_timeout_secs
                );
                self.reconcile_destroy(name).await
            }
        }
    }

    async fn persist(&self, record: &ForkRecord) {
        let store = &self.inner.store;
        if let Err(e) = store.upsert_fork(record).await {
            error!("Failed to persist fork {}: {}", record.id, e);
        }
        if let Err(e) = store.append_audit(AuditEntry::fork_transition(record)).await {
            error!("Failed to audit fork {}: {}", record.id, e);
        }
    }

    /// Announce a fork transition. After shutdown the manager's agent has
    /// already reported itself stopped, so direct calls still change state
    /// but publish nothing.
    fn publish(&self, payload: EventPayload) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            debug!("Fork manager stopped, not publishing {}", payload.kind());
            return;
        }
        self.inner.bus.publish(Event::new(FORK_MANAGER_NAME, payload));
    }

    async fn on_request_event(&self, event: &Event) {
        let EventPayload::ForkRequested {
            requester,
            purpose,
            ttl_secs,
        } = &event.payload
        else {
            return;
        };

        let ttl = ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.inner.config.default_ttl());
        let request = ForkRequest::new(requester.clone(), purpose.clone(), ttl);
        if let Err(e) = self.request(request).await {
            self.publish(EventPayload::ForkFailed {
                fork_id: None,
                requester: requester.clone(),
                purpose: purpose.clone(),
                reason: e.to_string(),
            });
        }
    }

    async fn on_completion_event(&self, event: &Event) {
        let EventPayload::ForkCompleted {
            fork_id,
            requester,
            result,
        } = &event.payload
        else {
            return;
        };

        info!("Fork {} completed by {}", fork_id, requester);
        let manager = self.clone();
        let id = ForkId::from(fork_id.as_str());
        let result = result.clone();
        self.track(async move {
            let outcome = match result {
                Some(result) => manager.complete_with_result(&id, result).await,
                None => manager.complete(&id).await,
            };
            if let Err(e) = outcome {
                warn!("Completion of fork {} failed: {}", id, e);
            }
        })
        .await;
    }
}

fn log_sweep(report: &ReapReport) {
    if *report != ReapReport::default() {
        info!(
            "Reaper sweep: {} expired, {} retried, {} destroyed, {} failed, {} purged",
            report.expired, report.retried, report.destroyed, report.failed, report.purged
        );
    }
}

#[async_trait::async_trait]
impl Agent for ForkManager {
    fn name(&self) -> &str {
        FORK_MANAGER_NAME
    }

    async fn run(&self, ctx: &AgentContext) -> Result<()> {
        let mut requests = ctx.subscribe(EventKind::ForkRequested)?;
        let mut completions = ctx.subscribe(EventKind::ForkCompleted)?;

        let period = self.inner.config.reaper_interval();
        let mut reaper = interval_at(Instant::now() + period, period);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Fork manager started for parent service {} (max {} forks, reaper every {}s)",
            self.inner.config.parent_service_id,
            self.inner.config.max_concurrent_forks,
            period.as_secs()
        );

        while ctx.is_running() {
            tokio::select! {
                Some(event) = requests.recv() => self.on_request_event(&event).await,
                Some(event) = completions.recv() => self.on_completion_event(&event).await,
                _ = reaper.tick() => self.sweep().await,
                _ = tokio::time::sleep(ctx.poll_interval()) => {}
            }
        }

        ctx.unsubscribe(&requests);
        ctx.unsubscribe(&completions);
        Ok(())
    }

    async fn on_stop(&self) {
        self.shutdown().await;
    }

    fn shutdown_grace(&self) -> Duration {
        let config = &self.inner.config;
        Duration::from_secs(
            config.shutdown_drain_secs
                + config.destroy_timeout_secs
                + config.query_timeout_secs * u64::from(config.reconcile_attempts),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::provisioner::MockProvisioner;
    use serde_json::json;

    fn config() -> ForkConfig {
        ForkConfig {
            parent_service_id: "svc-parent".into(),
            max_concurrent_forks: 2,
            reconcile_attempts: 2,
            ..ForkConfig::default()
        }
    }

    fn provisioned(service_id: &str) -> ProvisionedFork {
        ProvisionedFork {
            service_id: service_id.to_string(),
            access: json!({"host": "fork.local", "service_id": service_id}),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            ForkConfig::default().validate().unwrap_err(),
            vec!["forks.parent_service_id must be set".to_string()]
        );
        assert!(config().validate().is_ok());

        let bad = ForkConfig {
            default_ttl_secs: 10_000,
            max_ttl_secs: 60,
            max_destroy_attempts: 0,
            ..config()
        };
        assert_eq!(bad.validate().unwrap_err().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_create_reconciled_to_active() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_create()
            .times(1)
            .returning(|_, _| Err(ProvisionError::Ambiguous("connection reset".into())));
        provisioner
            .expect_find()
            .times(1)
            .returning(|_| Ok(Some(provisioned("svc-7"))));

        let bus = EventBus::default();
        let mut created = bus.subscribe(EventKind::ForkCreated).unwrap();
        let manager = ForkManager::builder(config(), bus, Arc::new(provisioner)).build();

        let id = manager
            .request(ForkRequest::new("backtest", "sweep", Duration::from_secs(600)))
            .await
            .unwrap();
        settle().await;

        let record = manager.get(&id).await.unwrap();
        assert_eq!(record.status, ForkStatus::Active);
        assert_eq!(record.service_id.as_deref(), Some("svc-7"));
        assert!(created.try_recv().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_create_fails_and_alerts() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_create()
            .returning(|_, _| Err(ProvisionError::Ambiguous("gateway timeout".into())));
        provisioner
            .expect_find()
            .times(2)
            .returning(|_| Err(ProvisionError::Failed("api unavailable".into())));

        let bus = EventBus::default();
        let alerts = Arc::new(AlertManager::with_defaults());
        let mut alert_rx = alerts.subscribe();
        let manager = ForkManager::builder(config(), bus, Arc::new(provisioner))
            .alerts(alerts)
            .build();

        let id = manager
            .request(ForkRequest::new("backtest", "sweep", Duration::from_secs(600)))
            .await
            .unwrap();
        // Past the one-second backoff between the two queries
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        let record = manager.get(&id).await.unwrap();
        assert_eq!(record.status, ForkStatus::Failed);
        assert!(record.last_error.unwrap().contains("unresolved"));
        assert_eq!(alert_rx.try_recv().unwrap().title, "Fork State Unresolved");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_event_request_publishes_failure() {
        let provisioner = MockProvisioner::new();
        let bus = EventBus::default();
        let mut failed = bus.subscribe(EventKind::ForkFailed).unwrap();
        let manager = ForkManager::builder(config(), bus, Arc::new(provisioner)).build();

        let event = Event::new(
            "backtest",
            EventPayload::ForkRequested {
                requester: "backtest".into(),
                purpose: "".into(),
                ttl_secs: None,
            },
        );
        manager.on_request_event(&event).await;

        let event = failed.try_recv().unwrap();
        match &event.payload {
            EventPayload::ForkFailed { fork_id, reason, .. } => {
                assert!(fork_id.is_none());
                assert!(reason.contains("purpose"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(manager.forks().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_refuses_requests() {
        let provisioner = MockProvisioner::new();
        let halt = Arc::new(HaltSwitch::new());
        let manager = ForkManager::builder(config(), EventBus::default(), Arc::new(provisioner))
            .halt_switch(halt.clone())
            .build();

        halt.trigger(crate::coordination::EmergencyReason::Manual, None)
            .await;
        let err = manager
            .request(ForkRequest::new("backtest", "sweep", Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, IcarusError::Halted(_)));
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_restores_active_forks() {
        let store = Arc::new(MemoryStore::new());
        let request = ForkRequest::new("backtest", "sweep", Duration::from_secs(600));
        let mut record = ForkRecord::creating("svc-parent", &request);
        record.status = ForkStatus::Active;
        record.service_id = Some("svc-9".into());
        record.expires_at = Some(Utc::now() + chrono::Duration::seconds(300));
        store.upsert_fork(&record).await.unwrap();

        let mut done = ForkRecord::creating("svc-parent", &request);
        done.status = ForkStatus::Destroyed;
        store.upsert_fork(&done).await.unwrap();

        let manager = ForkManager::builder(config(), EventBus::default(), Arc::new(MockProvisioner::new()))
            .store(store)
            .build();
        assert_eq!(manager.recover().await.unwrap(), 1);

        let restored = manager.get(&record.id).await.unwrap();
        assert_eq!(restored.status, ForkStatus::Active);
        assert!(restored.deadline().is_some());
        assert!(manager.get(&done.id).await.is_none());
    }

    /// Active fork `svc-1` on a manager whose provider is `provisioner`
    async fn active_fork(
        mut provisioner: MockProvisioner,
        bus: EventBus,
    ) -> (ForkManager, ForkId) {
        provisioner
            .expect_create()
            .times(1)
            .returning(|_, _| Ok(provisioned("svc-1")));
        let manager = ForkManager::builder(config(), bus, Arc::new(provisioner)).build();
        let id = manager
            .request(ForkRequest::new("backtest", "sweep", Duration::from_secs(600)))
            .await
            .unwrap();
        settle().await;
        assert_eq!(manager.get(&id).await.unwrap().status, ForkStatus::Active);
        (manager, id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_destroy_of_vanished_fork_is_destroyed() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_destroy()
            .times(1)
            .returning(|_| Err(ProvisionError::Ambiguous("connection reset".into())));
        provisioner
            .expect_find()
            .times(1)
            .withf(|name| name.starts_with("icarus-fork-"))
            .returning(|_| Ok(None));

        let bus = EventBus::default();
        let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
        let (manager, id) = active_fork(provisioner, bus).await;

        manager.complete(&id).await.unwrap();
        let record = manager.get(&id).await.unwrap();
        assert_eq!(record.status, ForkStatus::Destroyed);
        assert_eq!(record.destroy_attempts, 0);
        match &destroyed.try_recv().unwrap().payload {
            EventPayload::ForkDestroyed { fork_id, .. } => assert_eq!(fork_id, id.as_str()),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_destroy_of_surviving_fork_counts_an_attempt() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_destroy()
            .times(1)
            .returning(|_| Err(ProvisionError::Ambiguous("gateway timeout".into())));
        provisioner
            .expect_find()
            .times(1)
            .returning(|_| Ok(Some(provisioned("svc-1"))));

        let bus = EventBus::default();
        let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
        let (manager, id) = active_fork(provisioner, bus).await;

        let err = manager.complete(&id).await.unwrap_err();
        assert!(matches!(err, IcarusError::Destroy { .. }));
        let record = manager.get(&id).await.unwrap();
        assert_eq!(record.status, ForkStatus::Destroying);
        assert_eq!(record.destroy_attempts, 1);
        assert!(record.last_error.unwrap().contains("still exists"));
        assert!(destroyed.try_recv().is_none());
    }

    /// Destroy that never answers
    struct HungDestroy {
        finds: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl Provisioner for HungDestroy {
        async fn create(
            &self,
            _parent_id: &str,
            _name: &str,
        ) -> std::result::Result<ProvisionedFork, ProvisionError> {
            Ok(provisioned("svc-1"))
        }

        async fn destroy(&self, _service_id: &str) -> std::result::Result<(), ProvisionError> {
            std::future::pending().await
        }

        async fn find(
            &self,
            _name: &str,
        ) -> std::result::Result<Option<ProvisionedFork>, ProvisionError> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_timeout_queries_provider_state() {
        let provisioner = Arc::new(HungDestroy {
            finds: std::sync::atomic::AtomicU32::new(0),
        });
        let config = ForkConfig {
            destroy_timeout_secs: 5,
            ..config()
        };
        let manager = ForkManager::builder(config, EventBus::default(), provisioner.clone()).build();
        let id = manager
            .request(ForkRequest::new("backtest", "sweep", Duration::from_secs(600)))
            .await
            .unwrap();
        settle().await;

        let started = Instant::now();
        manager.complete(&id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(provisioner.finds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get(&id).await.unwrap().status, ForkStatus::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_manager_publishes_nothing() {
        let mut provisioner = MockProvisioner::new();
        provisioner.expect_destroy().times(1).returning(|_| Ok(()));

        let bus = EventBus::default();
        let mut destroyed = bus.subscribe(EventKind::ForkDestroyed).unwrap();
        provisioner
            .expect_create()
            .times(1)
            .returning(|_, _| Ok(provisioned("svc-1")));
        let config = ForkConfig {
            destroy_on_shutdown: false,
            ..config()
        };
        let manager = ForkManager::builder(config, bus, Arc::new(provisioner)).build();
        let id = manager
            .request(ForkRequest::new("backtest", "sweep", Duration::from_secs(600)))
            .await
            .unwrap();
        settle().await;

        manager.shutdown().await;
        manager.complete(&id).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().status, ForkStatus::Destroyed);
        assert!(destroyed.try_recv().is_none());
    }
}
