//! Agent runtime: ordered startup and shutdown of supervised agents
//!
//! Composition root for agents. Each agent is spawned with a priority;
//! lower priority starts first and stops last. Shutdown stops agents one
//! by one in reverse order, aborting any that overrun the stop timeout, and
//! closes the bus last.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agents::Agent;
use crate::bus::EventBus;
use crate::error::Result;
use crate::supervisor::{AgentStatus, AgentSupervisor, SupervisorConfig};

use super::emergency_stop::HaltSwitch;

struct ManagedAgent {
    priority: u8,
    supervisor: Arc<AgentSupervisor>,
    handle: JoinHandle<Result<()>>,
}

pub struct AgentRuntime {
    bus: EventBus,
    halt: Arc<HaltSwitch>,
    config: SupervisorConfig,
    agents: RwLock<Vec<ManagedAgent>>,
}

impl AgentRuntime {
    pub fn new(bus: EventBus, halt: Arc<HaltSwitch>, config: SupervisorConfig) -> Self {
        Self {
            bus,
            halt,
            config,
            agents: RwLock::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn halt(&self) -> &Arc<HaltSwitch> {
        &self.halt
    }

    /// Supervise and start `agent` (lower priority = started first, stopped last)
    pub async fn spawn(&self, agent: Arc<dyn Agent>, priority: u8) -> Arc<AgentSupervisor> {
        let supervisor = Arc::new(
            AgentSupervisor::new(agent, self.bus.clone(), self.config.clone())
                .with_halt(self.halt.subscribe()),
        );
        let handle = supervisor.spawn();
        debug!(
            "Spawned agent {} with priority {}",
            supervisor.name(),
            priority
        );

        self.agents.write().await.push(ManagedAgent {
            priority,
            supervisor: supervisor.clone(),
            handle,
        });
        supervisor
    }

    pub async fn supervisor(&self, name: &str) -> Option<Arc<AgentSupervisor>> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.supervisor.name() == name)
            .map(|a| a.supervisor.clone())
    }

    pub async fn get_all_states(&self) -> HashMap<String, AgentStatus> {
        self.agents
            .read()
            .await
            .iter()
            .map(|a| (a.supervisor.name().to_string(), a.supervisor.status()))
            .collect()
    }

    /// Agent names, lowest priority first
    pub async fn get_startup_order(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        let mut ordered: Vec<_> = agents.iter().collect();
        ordered.sort_by_key(|a| a.priority);
        ordered
            .iter()
            .map(|a| a.supervisor.name().to_string())
            .collect()
    }

    /// Reverse of startup
    pub async fn get_shutdown_order(&self) -> Vec<String> {
        let mut order = self.get_startup_order().await;
        order.reverse();
        order
    }

    /// Stop every agent in shutdown order, then close the bus
    pub async fn shutdown(&self, reason: &str) {
        let start_time = std::time::Instant::now();

        let mut agents = std::mem::take(&mut *self.agents.write().await);
        agents.sort_by_key(|a| a.priority);
        agents.reverse();

        let order: Vec<_> = agents.iter().map(|a| a.supervisor.name().to_string()).collect();
        info!(
            "Stopping {} agents in order: {:?} (reason: {})",
            order.len(),
            order,
            reason
        );

        for managed in agents {
            let name = managed.supervisor.name().to_string();
            match managed.supervisor.stop().await {
                Ok(()) => {
                    if let Err(e) = managed.handle.await {
                        warn!("Agent {} task ended abnormally: {}", name, e);
                    }
                }
                Err(e) => {
                    warn!("Agent {} shutdown timeout: {}", name, e);
                    managed.handle.abort();
                    managed.supervisor.mark_aborted();
                }
            }
        }

        self.bus.shutdown();

        let duration = start_time.elapsed().as_millis() as u64;
        info!("All agents stopped in {}ms", duration);
    }
}
