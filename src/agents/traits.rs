//! Agent trait: pull-based agent interface
//!
//! An agent owns its main loop via `run()`. The supervisor drives the
//! lifecycle around it and hands it an [`AgentContext`] for bus access and
//! stop detection.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

use super::context::AgentContext;

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Unique name, used as the event source
    fn name(&self) -> &str;

    /// Main agent loop. Must return within one poll interval once
    /// `ctx.is_running()` turns false. Errors and panics are reported as
    /// agent faults.
    async fn run(&self, ctx: &AgentContext) -> Result<()>;

    /// Cleanup hook, runs after `run` returns and before the agent is
    /// reported stopped
    async fn on_stop(&self) {}

    /// Extra time the stop hook may take on top of the supervisor's stop
    /// timeout
    fn shutdown_grace(&self) -> Duration {
        Duration::ZERO
    }
}
