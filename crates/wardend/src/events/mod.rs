//! Typed progress events and their publish/subscribe fan-out.

mod bus;
mod kind;

pub use bus::{BusStats, DEFAULT_SUBSCRIBER_CAPACITY, EventBus};
pub use kind::{Event, EventKind, VerifyPhase};

pub(crate) const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");
