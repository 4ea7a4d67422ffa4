//! AgentContext: the agent's interface to the bus and its supervisor
//!
//! Cloneable, so helper tasks spawned by an agent share the same stop flag.
//! Once the supervisor seals the context, publishes through it are refused;
//! this keeps the agent's stopped event the last one it ever emits.

use futures::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{Event, EventBus, EventKind, EventPayload, Mailbox, MailboxRecv};
use crate::error::Result;

#[derive(Clone)]
pub struct AgentContext {
    name: Arc<str>,
    bus: EventBus,
    stop_requested: Arc<AtomicBool>,
    sealed: Arc<RwLock<bool>>,
    poll_interval: Duration,
    halt: Option<watch::Receiver<bool>>,
}

impl AgentContext {
    pub fn new(
        name: &str,
        bus: EventBus,
        stop_requested: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: Arc::from(name),
            bus,
            stop_requested,
            sealed: Arc::new(RwLock::new(false)),
            poll_interval,
            halt: None,
        }
    }

    pub fn with_halt(mut self, halt: watch::Receiver<bool>) -> Self {
        self.halt = Some(halt);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// False once a stop was requested or the context was sealed
    pub fn is_running(&self) -> bool {
        !self.stop_requested.load(Ordering::SeqCst) && !self.is_sealed()
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the emergency halt is engaged
    pub fn is_halted(&self) -> bool {
        self.halt.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Publish with this agent as the source. Returns the number of
    /// mailboxes reached; zero after the context is sealed.
    pub fn publish(&self, payload: EventPayload) -> usize {
        let sealed = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        if *sealed {
            warn!(
                "Agent {} publish of {} after stop refused",
                self.name,
                payload.kind()
            );
            return 0;
        }
        self.bus.publish(Event::new(self.name.as_ref(), payload))
    }

    pub fn subscribe(&self, kind: EventKind) -> Result<Mailbox> {
        self.bus.subscribe(kind)
    }

    pub fn unsubscribe(&self, mailbox: &Mailbox) {
        self.bus.unsubscribe(mailbox.kind(), mailbox);
    }

    /// Next event from `mailbox`, or `None` once the agent should stop or
    /// the bus closed. Waits in poll-interval slices so a stop is noticed
    /// within one interval.
    pub async fn next_event(&self, mailbox: &mut Mailbox) -> Option<Arc<Event>> {
        while self.is_running() {
            match mailbox.recv_timeout(self.poll_interval).await {
                MailboxRecv::Event(event) if self.is_running() => return Some(event),
                MailboxRecv::Event(_) => break,
                MailboxRecv::Timeout => continue,
                MailboxRecv::Closed => {
                    debug!("Agent {} mailbox for {} closed", self.name, mailbox.kind());
                    break;
                }
            }
        }
        None
    }

    /// Turn a mailbox into a stream that ends when the agent stops
    pub fn consume(&self, mailbox: Mailbox) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        let ctx = self.clone();
        futures::stream::unfold((ctx, mailbox), |(ctx, mut mailbox)| async move {
            let event = ctx.next_event(&mut mailbox).await?;
            Some((event, (ctx, mailbox)))
        })
    }

    /// Sleep that wakes early on stop. Returns true if the full duration
    /// elapsed while still running.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
        false
    }

    /// Refuse every later publish; waits out publishes already in progress
    pub(crate) fn seal(&self) {
        *self.sealed.write().unwrap_or_else(PoisonError::into_inner) = true;
    }
}
