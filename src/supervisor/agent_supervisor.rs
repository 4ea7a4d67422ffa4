//! Agent supervisor
//!
//! Drives one agent through `starting -> running -> stopping -> stopped`
//! (with `error` on a fault). The supervisor, not the agent, publishes the
//! lifecycle events, and finalisation runs on every exit path so the
//! stopped event is always the agent's last.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::agents::{Agent, AgentContext};
use crate::bus::{Event, EventBus, EventPayload};
use crate::error::{IcarusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Starting => write!(f, "starting"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Stopping => write!(f, "stopping"),
            AgentStatus::Stopped => write!(f, "stopped"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// `[agents]` configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Upper bound on how long an agent takes to notice a stop (default: 1000ms)
    pub poll_interval_ms: u64,
    /// Time an agent gets to reach `stopped` before it is aborted (default: 10s)
    pub stop_timeout_ms: u64,
    /// Heartbeat period; 0 disables heartbeats (default: 30s)
    pub heartbeat_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            stop_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

pub struct AgentSupervisor {
    agent: Arc<dyn Agent>,
    name: String,
    bus: EventBus,
    config: SupervisorConfig,
    halt: Option<watch::Receiver<bool>>,
    stop_requested: Arc<AtomicBool>,
    status_tx: watch::Sender<AgentStatus>,
}

impl AgentSupervisor {
    pub fn new(agent: Arc<dyn Agent>, bus: EventBus, config: SupervisorConfig) -> Self {
        let name = agent.name().to_string();
        let (status_tx, _) = watch::channel(AgentStatus::Starting);
        Self {
            agent,
            name,
            bus,
            config,
            halt: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            status_tx,
        }
    }

    /// Expose the halt flag to the agent through its context
    pub fn with_halt(mut self, halt: watch::Receiver<bool>) -> Self {
        self.halt = Some(halt);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> AgentStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.status_tx.subscribe()
    }

    /// Run the agent to completion on its own task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run().await })
    }

    /// Run the agent on the current task. A supervisor runs at most once.
    pub async fn run(&self) -> Result<()> {
        let began = self.status_tx.send_if_modified(|status| {
            if *status == AgentStatus::Starting {
                *status = AgentStatus::Running;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(IcarusError::InvalidStateTransition {
                from: self.status().to_string(),
                to: AgentStatus::Running.to_string(),
            });
        }

        info!("Starting agent: {}", self.name);
        let mut ctx = AgentContext::new(
            &self.name,
            self.bus.clone(),
            self.stop_requested.clone(),
            self.config.poll_interval(),
        );
        if let Some(ref halt) = self.halt {
            ctx = ctx.with_halt(halt.clone());
        }

        ctx.publish(EventPayload::AgentStarted {
            agent: self.name.clone(),
        });
        let heartbeat = self.spawn_heartbeat(&ctx);

        let result = match AssertUnwindSafe(self.agent.run(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(IcarusError::AgentPanicked {
                agent: self.name.clone(),
                message: panic_message(panic.as_ref()),
            }),
        };

        if let Some(handle) = heartbeat {
            handle.abort();
        }

        let reason = match &result {
            Ok(()) if self.stop_requested.load(Ordering::SeqCst) => "stop_requested",
            Ok(()) => "completed",
            Err(e) => {
                error!("Agent {} error: {}", self.name, e);
                self.status_tx.send_replace(AgentStatus::Error);
                ctx.publish(EventPayload::AgentError {
                    agent: self.name.clone(),
                    error_kind: e.kind().to_string(),
                    message: e.to_string(),
                    recoverable: e.is_recoverable(),
                });
                "error"
            }
        };

        self.finalize(&ctx, reason).await;
        result
    }

    async fn finalize(&self, ctx: &AgentContext, reason: &str) {
        // Helper tasks sharing the context see the stop
        self.stop_requested.store(true, Ordering::SeqCst);
        self.status_tx.send_if_modified(|status| {
            if *status == AgentStatus::Running {
                *status = AgentStatus::Stopping;
                true
            } else {
                false
            }
        });

        let hook = AssertUnwindSafe(self.agent.on_stop()).catch_unwind();
        match timeout(self.stop_budget(), hook).await {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => error!(
                "Agent {} panicked in stop hook: {}",
                self.name,
                panic_message(panic.as_ref())
            ),
            Err(_) => warn!(
                "Agent {} stop hook exceeded {}ms",
                self.name,
                self.stop_budget().as_millis()
            ),
        }

        ctx.seal();
        self.mark_stopped(reason);
    }

    fn mark_stopped(&self, reason: &str) {
        self.status_tx.send_replace(AgentStatus::Stopped);
        self.bus.publish(Event::new(
            self.name.as_str(),
            EventPayload::AgentStopped {
                agent: self.name.clone(),
                reason: reason.to_string(),
            },
        ));
        info!("Agent {} stopped ({})", self.name, reason);
    }

    fn spawn_heartbeat(&self, ctx: &AgentContext) -> Option<JoinHandle<()>> {
        let period = self.config.heartbeat_interval()?;
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            while ctx.sleep(period).await {
                ctx.publish(EventPayload::AgentHeartbeat {
                    agent: ctx.name().to_string(),
                    status: AgentStatus::Running.to_string(),
                });
            }
        }))
    }

    /// Request a stop and wait until the agent reports `stopped`
    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);

        let never_started = self.status_tx.send_if_modified(|status| {
            if *status == AgentStatus::Starting {
                *status = AgentStatus::Stopping;
                true
            } else {
                false
            }
        });
        if never_started {
            debug!("Agent {} stopped before it started", self.name);
            self.mark_stopped("stopped_before_start");
            return Ok(());
        }

        info!("Stopping agent: {}", self.name);
        self.status_tx.send_if_modified(|status| {
            if *status == AgentStatus::Running {
                *status = AgentStatus::Stopping;
                true
            } else {
                false
            }
        });

        let mut rx = self.status_tx.subscribe();
        // Body gets one poll interval to notice, the stop hook gets the rest
        let budget = self.stop_budget() + self.config.poll_interval();
        let settled = timeout(budget, rx.wait_for(|status| *status == AgentStatus::Stopped))
            .await
            .map(|_| ());
        match settled {
            Ok(()) => Ok(()),
            Err(_) => Err(IcarusError::Timeout(format!(
                "agent {} did not stop within {}ms",
                self.name,
                budget.as_millis()
            ))),
        }
    }

    fn stop_budget(&self) -> Duration {
        self.config.stop_timeout() + self.agent.shutdown_grace()
    }

    /// Record a forced stop after the agent's task was aborted
    pub fn mark_aborted(&self) {
        if self.status() != AgentStatus::Stopped {
            warn!("Agent {} aborted after stop timeout", self.name);
            self.mark_stopped("aborted");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
