//! Defines the unified error surface for daemon launch.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::scheduler::SchedulerError;

use super::shutdown::ShutdownError;

/// Errors surfaced while launching or supervising the daemon.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bootstrap failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// The scheduler could not start.
    #[error("failed to start scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
    /// Waiting for the termination signal failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}
