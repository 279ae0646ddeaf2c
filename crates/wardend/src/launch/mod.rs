//! Process-level launch sequencing and shutdown handling.

mod errors;
mod run;
mod shutdown;

pub use errors::LaunchError;
pub use run::{LaunchPlan, run_daemon, run_daemon_with};
pub use shutdown::{
    RELOAD_SIGNAL, Reload, ShutdownError, ShutdownSignal, SystemShutdownSignal, TERMINATION_SIGNALS,
};

pub(crate) const LAUNCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launch");
