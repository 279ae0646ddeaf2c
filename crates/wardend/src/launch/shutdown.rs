use std::io;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{info, warn};

use super::LAUNCH_TARGET;
use crate::scheduler::{SchedulerError, StartStatus};

/// Signals that end the daemon.
pub const TERMINATION_SIGNALS: [i32; 3] = [SIGTERM, SIGINT, SIGQUIT];
/// Signal that makes the scheduler re-read its intervals.
pub const RELOAD_SIGNAL: i32 = SIGHUP;

/// Restarts the scheduler with fresh settings.
pub type Reload<'a> = &'a dyn Fn() -> Result<StartStatus, SchedulerError>;

/// Blocks the launching thread until the daemon should stop.
pub trait ShutdownSignal: Send + Sync {
    /// Waits for a termination request, running `reload` for every reload
    /// request received first.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] when the listener cannot be installed.
    fn wait(&self, reload: Reload<'_>) -> Result<(), ShutdownError>;
}

/// Errors reported by shutdown listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Listener for POSIX signals: SIGHUP reloads, SIGTERM, SIGINT and SIGQUIT
/// stop.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self, reload: Reload<'_>) -> Result<(), ShutdownError> {
        let mut signals = Signals::new(TERMINATION_SIGNALS.iter().chain([&RELOAD_SIGNAL]))
            .map_err(|source| ShutdownError::Install { source })?;
        if let Some(signal) = dispatch(signals.forever(), reload) {
            info!(target: LAUNCH_TARGET, signal, "shutdown signal received");
        }
        Ok(())
    }
}

/// Runs `reload` for each reload signal and returns the first termination
/// signal, or `None` when the stream ends.
fn dispatch(signals: impl IntoIterator<Item = i32>, reload: Reload<'_>) -> Option<i32> {
    for signal in signals {
        if signal != RELOAD_SIGNAL {
            return Some(signal);
        }
        match reload() {
            Ok(status) => info!(target: LAUNCH_TARGET, %status, "scheduler reloaded"),
            Err(error) => warn!(target: LAUNCH_TARGET, %error, "scheduler reload failed"),
        }
    }
    None
}
