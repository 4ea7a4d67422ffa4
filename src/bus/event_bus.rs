//! Event Bus - kind-indexed publish/subscribe router
//!
//! Each subscription owns a bounded mailbox. Publishing never blocks: a full
//! mailbox drops the newest event for that subscriber only and bumps the
//! dropped counter. FIFO holds per mailbox; nothing is ordered across
//! mailboxes. There is no durability or replay.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::event::{Event, EventKind};
use crate::error::{IcarusError, Result};

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum events buffered per mailbox
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

/// Counters exposed by the bus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    /// Live subscriptions per kind (kinds without subscribers are omitted)
    pub subscribers_by_kind: BTreeMap<EventKind, usize>,
}

/// Outcome of a bounded mailbox wait
#[derive(Debug)]
pub enum MailboxRecv {
    Event(Arc<Event>),
    /// Nothing arrived within the wait
    Timeout,
    /// Unsubscribed or bus shut down, and the mailbox is drained
    Closed,
}

/// Receiving side of a subscription
pub struct Mailbox {
    id: u64,
    kind: EventKind,
    rx: mpsc::Receiver<Arc<Event>>,
}

impl Mailbox {
    /// Subscription identifier, unique per bus
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Wait for the next event for at most `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> MailboxRecv {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => MailboxRecv::Event(event),
            Ok(None) => MailboxRecv::Closed,
            Err(_) => MailboxRecv::Timeout,
        }
    }

    /// Take the next buffered event, if any
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    /// Events currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Unbounded wait; only used inside `select!` arms raced against a timer
    pub(crate) async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("buffered", &self.rx.len())
            .finish()
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<Event>>,
}

struct BusInner {
    subscribers: DashMap<EventKind, Vec<Subscriber>>,
    mailbox_capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Kind-indexed pub/sub router. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create a new bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                // tokio channels reject a zero capacity
                mailbox_capacity: config.mailbox_capacity.max(1),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus with a specific mailbox capacity
    pub fn with_capacity(mailbox_capacity: usize) -> Self {
        Self::new(BusConfig { mailbox_capacity })
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.inner.mailbox_capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register a new bounded mailbox for `kind`
    pub fn subscribe(&self, kind: EventKind) -> Result<Mailbox> {
        if self.is_closed() {
            return Err(IcarusError::BusClosed);
        }

        let (tx, rx) = mpsc::channel(self.inner.mailbox_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .entry(kind)
            .or_default()
            .push(Subscriber { id, tx });

        // shutdown may have cleared the map between the check and the insert
        if self.is_closed() {
            self.remove_subscriber(kind, id);
            return Err(IcarusError::BusClosed);
        }

        debug!("New subscription #{} to {}", id, kind);
        Ok(Mailbox { id, kind, rx })
    }

    /// Remove a subscription. Safe to call repeatedly.
    pub fn unsubscribe(&self, kind: EventKind, mailbox: &Mailbox) {
        if mailbox.kind != kind {
            debug!(
                "Mailbox #{} is subscribed to {}, not {}; nothing to remove",
                mailbox.id, mailbox.kind, kind
            );
            return;
        }
        if self.remove_subscriber(kind, mailbox.id) {
            debug!("Unsubscribed #{} from {}", mailbox.id, kind);
        }
    }

    fn remove_subscriber(&self, kind: EventKind, id: u64) -> bool {
        let mut removed = false;
        if let Some(mut subs) = self.inner.subscribers.get_mut(&kind) {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed = subs.len() != before;
        }
        self.inner
            .subscribers
            .remove_if(&kind, |_, subs| subs.is_empty());
        removed
    }

    /// Deliver `event` to every mailbox subscribed to its kind.
    ///
    /// Never blocks and never fails; returns the number of mailboxes that
    /// accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        if self.is_closed() {
            debug!("Bus closed, discarding {} from {}", kind, event.source);
            return 0;
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);
        let mut delivered = 0usize;
        let mut stale = Vec::new();

        match self.inner.subscribers.get(&kind) {
            Some(subs) => {
                for sub in subs.iter() {
                    match sub.tx.try_send(Arc::clone(&event)) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!("Mailbox #{} full for {}, dropping event", sub.id, kind);
                        }
                        Err(TrySendError::Closed(_)) => stale.push(sub.id),
                    }
                }
            }
            None => debug!("No subscribers for {}", kind),
        }

        // mailboxes dropped without unsubscribing
        for id in stale {
            self.remove_subscriber(kind, id);
        }

        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of live subscriptions for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .get(&kind)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Snapshot of the bus counters
    pub fn stats(&self) -> BusStats {
        let subscribers_by_kind = EventKind::ALL
            .iter()
            .map(|kind| (*kind, self.subscriber_count(*kind)))
            .filter(|(_, count)| *count > 0)
            .collect();

        BusStats {
            events_published: self.inner.published.load(Ordering::Relaxed),
            events_delivered: self.inner.delivered.load(Ordering::Relaxed),
            events_dropped: self.inner.dropped.load(Ordering::Relaxed),
            subscribers_by_kind,
        }
    }

    /// Stop accepting subscriptions and publishes.
    ///
    /// Senders are released, so every mailbox drains what it already holds
    /// and then reports [`MailboxRecv::Closed`].
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let kinds = self.inner.subscribers.len();
        self.inner.subscribers.clear();
        info!("Event bus closed ({} subscribed kinds released)", kinds);
    }
}
