//! Event Bus
//!
//! Process-wide publish/subscribe router connecting agents. Leaf component:
//! depends on nothing else in the crate except the error type.

pub mod event;
pub mod event_bus;

pub use event::{Event, EventKind, EventPayload};
pub use event_bus::{BusConfig, BusStats, EventBus, Mailbox, MailboxRecv};
