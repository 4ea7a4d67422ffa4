//! Reusable agent shapes
//!
//! Most agents are either "do something every N seconds" or "react to these
//! event kinds". Both wrap a small trait object into a full [`Agent`] so
//! implementors never write their own loop or stop handling.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::bus::{Event, EventKind};
use crate::error::Result;

use super::context::AgentContext;
use super::traits::Agent;

/// One iteration of a periodic agent
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn iterate(&self, ctx: &AgentContext) -> Result<()>;

    async fn on_stop(&self) {}
}

/// Runs a [`PeriodicTask`] every `interval()` until stopped. A failing
/// iteration is logged and the loop continues.
pub struct PeriodicAgent<T> {
    task: T,
}

impl<T: PeriodicTask> PeriodicAgent<T> {
    pub fn new(task: T) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &T {
        &self.task
    }
}

#[async_trait]
impl<T: PeriodicTask> Agent for PeriodicAgent<T> {
    fn name(&self) -> &str {
        self.task.name()
    }

    async fn run(&self, ctx: &AgentContext) -> Result<()> {
        while ctx.is_running() {
            if let Err(e) = self.task.iterate(ctx).await {
                error!("Iteration error in {}: {}", self.task.name(), e);
            }
            if !ctx.sleep(self.task.interval()).await {
                break;
            }
        }
        Ok(())
    }

    async fn on_stop(&self) {
        self.task.on_stop().await;
    }
}

/// Reaction to events of a fixed set of kinds
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Kinds to subscribe to; fixed for the agent's lifetime
    fn kinds(&self) -> Vec<EventKind>;

    async fn handle(&self, ctx: &AgentContext, event: Arc<Event>) -> Result<()>;

    async fn on_stop(&self) {}
}

/// Feeds every event of the handler's kinds to [`EventHandler::handle`].
/// A failing handler call is logged and the agent keeps consuming.
pub struct EventDrivenAgent<H> {
    handler: H,
}

impl<H: EventHandler> EventDrivenAgent<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: EventHandler> Agent for EventDrivenAgent<H> {
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn run(&self, ctx: &AgentContext) -> Result<()> {
        let kinds = self.handler.kinds();
        if kinds.is_empty() {
            warn!("No event subscriptions configured for {}", self.handler.name());
            return Ok(());
        }

        let mut streams = Vec::with_capacity(kinds.len());
        for kind in kinds {
            streams.push(ctx.consume(ctx.subscribe(kind)?).boxed());
        }

        let mut events = stream::select_all(streams);
        while let Some(event) = events.next().await {
            if let Err(e) = self.handler.handle(ctx, event).await {
                error!("Error handling event in {}: {}", self.handler.name(), e);
            }
        }
        Ok(())
    }

    async fn on_stop(&self) {
        self.handler.on_stop().await;
    }
}
