//! Supervises daemon launch sequencing and runtime orchestration.

use std::sync::Arc;

use tracing::info;

use crate::bootstrap::{
    ConfigLoader, EngineProvider, SingBoxProvider, SystemConfigLoader, bootstrap_with,
};
use crate::store::{MemoryStore, Store};

use super::LAUNCH_TARGET;
use super::errors::LaunchError;
use super::shutdown::{ShutdownSignal, SystemShutdownSignal};

/// Collaborators required to launch the daemon runtime.
pub struct LaunchPlan<L, P, S> {
    /// Configuration source.
    pub loader: L,
    /// Store holding nodes, settings and logs.
    pub store: Arc<dyn Store>,
    /// Builds the probe engine and measurer.
    pub provider: P,
    /// Blocks until the daemon should stop.
    pub shutdown: S,
}

/// Runs the daemon using the production collaborators and an in-process
/// store.
///
/// # Errors
///
/// Returns [`LaunchError`] when bootstrap, scheduler start-up or signal
/// installation fail.
pub fn run_daemon() -> Result<(), LaunchError> {
    run_daemon_with(LaunchPlan {
        loader: SystemConfigLoader,
        store: Arc::new(MemoryStore::new()),
        provider: SingBoxProvider,
        shutdown: SystemShutdownSignal,
    })
}

/// Runs the daemon with injected collaborators.
///
/// The scheduler starts once bootstrap succeeds. Reload requests restart it
/// with the store's current intervals. When the shutdown signal fires the
/// scheduler loops are joined and the probe is stopped before this returns,
/// whether or not the wait itself failed.
///
/// # Errors
///
/// Returns [`LaunchError`] when bootstrap, scheduler start-up or signal
/// installation fail.
pub fn run_daemon_with<L, P, S>(plan: LaunchPlan<L, P, S>) -> Result<(), LaunchError>
where
    L: ConfigLoader,
    P: EngineProvider,
    S: ShutdownSignal,
{
    let LaunchPlan {
        loader,
        store,
        provider,
        shutdown,
    } = plan;

    let daemon = bootstrap_with(&loader, store, &provider)?;
    info!(target: LAUNCH_TARGET, pid = std::process::id(), "starting daemon runtime");
    let status = daemon.start()?;
    info!(target: LAUNCH_TARGET, status = %status, "scheduler status");

    let waited = shutdown.wait(&|| daemon.reload());
    daemon.shutdown();
    waited?;
    info!(target: LAUNCH_TARGET, "shutdown sequence completed");
    Ok(())
}
