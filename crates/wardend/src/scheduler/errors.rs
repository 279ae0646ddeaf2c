use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while starting the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Interval settings could not be read.
    #[error("failed to read scheduler settings: {source}")]
    Settings {
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
    /// A worker thread could not be spawned.
    #[error("failed to spawn {worker} worker: {source}")]
    Spawn {
        /// Loop name.
        worker: &'static str,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Outcome of [`Scheduler::start`](super::Scheduler::start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// Both intervals are zero; nothing was started.
    AllDisabled,
    /// The scheduler was already running; nothing changed.
    AlreadyRunning,
    /// The scheduler started the enabled loops.
    Running {
        /// Whether the subscription refresh loop runs.
        subscription: bool,
        /// Whether the verification loop runs.
        verification: bool,
    },
}

impl fmt::Display for StartStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = |enabled: bool| if enabled { "enabled" } else { "disabled" };
        match self {
            Self::AllDisabled => formatter.write_str("all disabled"),
            Self::AlreadyRunning => formatter.write_str("already running"),
            Self::Running {
                subscription,
                verification,
            } => write!(
                formatter,
                "subscription {}, verification {}",
                label(*subscription),
                label(*verification)
            ),
        }
    }
}
