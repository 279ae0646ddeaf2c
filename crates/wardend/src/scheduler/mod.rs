//! Periodic subscription refresh and verification loops.
//!
//! The scheduler owns zero, one or two worker threads depending on the
//! interval settings read from the store when it starts. A manual
//! verification resets the periodic timer so the next automatic run is one
//! full interval after the manual one.

mod errors;
mod hooks;
mod runner;
mod signals;

pub use errors::{SchedulerError, StartStatus};
pub use hooks::{HookError, ScheduleHooks};
pub use runner::{DEFAULT_INTERVAL_UNIT, Scheduler};
pub use signals::ResetOutcome;

pub(crate) const SCHEDULER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::scheduler");
