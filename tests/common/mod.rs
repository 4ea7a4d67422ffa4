#![allow(dead_code)]

use async_trait::async_trait;
use icarus::fork::{ForkConfig, ProvisionError, ProvisionedFork, Provisioner};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted outcome of the next `create` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Succeed,
    /// Fork is made but the call reports an unknown outcome
    AmbiguousButCreated,
    /// Nothing is made and the call reports an unknown outcome
    AmbiguousNotCreated,
    Fail,
}

#[derive(Default)]
struct FakeState {
    /// name -> fork
    services: HashMap<String, ProvisionedFork>,
    next_service: u32,
    create_script: VecDeque<CreateOutcome>,
    create_delay: Option<Duration>,
    destroy_failures: u32,
    destroy_stall: Option<Duration>,
    creates: u32,
    destroys: u32,
    finds: u32,
}

/// In-memory provider: forks live in a map keyed by name
#[derive(Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for the next creates, in order; later creates succeed
    pub fn script_creates(&self, outcomes: &[CreateOutcome]) {
        self.state.lock().unwrap().create_script.extend(outcomes);
    }

    pub fn delay_creates(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    /// Fail the next `n` destroys
    pub fn fail_destroys(&self, n: u32) {
        self.state.lock().unwrap().destroy_failures = n;
    }

    /// Make the next destroy hang for `delay` before it takes effect
    pub fn stall_next_destroy(&self, delay: Duration) {
        self.state.lock().unwrap().destroy_stall = Some(delay);
    }

    /// Pretend a fork named `name` already exists
    pub fn insert(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let fork = make_fork(&mut state);
        let service_id = fork.service_id.clone();
        state.services.insert(name.to_string(), fork);
        service_id
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().services.contains_key(name)
    }

    pub fn live_services(&self) -> usize {
        self.state.lock().unwrap().services.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().creates
    }

    pub fn destroy_calls(&self) -> u32 {
        self.state.lock().unwrap().destroys
    }

    pub fn find_calls(&self) -> u32 {
        self.state.lock().unwrap().finds
    }
}

fn make_fork(state: &mut FakeState) -> ProvisionedFork {
    state.next_service += 1;
    let service_id = format!("svc-fork-{}", state.next_service);
    ProvisionedFork {
        access: json!({
            "host": format!("{}.fake.local", service_id),
            "port": 5432,
            "service_id": service_id,
        }),
        service_id,
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn create(
        &self,
        _parent_id: &str,
        name: &str,
    ) -> Result<ProvisionedFork, ProvisionError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.creates += 1;
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let outcome = state
            .create_script
            .pop_front()
            .unwrap_or(CreateOutcome::Succeed);
        match outcome {
            CreateOutcome::Succeed => {
                let fork = make_fork(&mut state);
                state.services.insert(name.to_string(), fork.clone());
                Ok(fork)
            }
            CreateOutcome::AmbiguousButCreated => {
                let fork = make_fork(&mut state);
                state.services.insert(name.to_string(), fork);
                Err(ProvisionError::Ambiguous("gateway timeout".into()))
            }
            CreateOutcome::AmbiguousNotCreated => {
                Err(ProvisionError::Ambiguous("connection reset".into()))
            }
            CreateOutcome::Fail => Err(ProvisionError::Failed("quota exceeded".into())),
        }
    }

    async fn destroy(&self, service_id: &str) -> Result<(), ProvisionError> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            state.destroys += 1;
            state.destroy_stall.take()
        };
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.destroy_failures > 0 {
            state.destroy_failures -= 1;
            return Err(ProvisionError::Failed("service busy".into()));
        }
        state.services.retain(|_, fork| fork.service_id != service_id);
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<ProvisionedFork>, ProvisionError> {
        let mut state = self.state.lock().unwrap();
        state.finds += 1;
        Ok(state.services.get(name).cloned())
    }
}

pub fn fork_config(max_concurrent_forks: usize) -> ForkConfig {
    ForkConfig {
        parent_service_id: "svc-parent".into(),
        max_concurrent_forks,
        reaper_interval_secs: 10,
        ..ForkConfig::default()
    }
}

/// Let spawned fork tasks run until they block on a timer. Needs a paused
/// clock, which only advances once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
