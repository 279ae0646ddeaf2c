use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::validate::ValidationError;

/// Errors raised while starting or stopping the probe.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    /// The engine binary could not be resolved.
    #[error("probe engine binary '{binary}' not found: {source}")]
    BinaryNotFound {
        /// Configured binary name or path.
        binary: String,
        /// Resolution failure.
        #[source]
        source: which::Error,
    },
    /// The request contained no nodes.
    #[error("no nodes to probe")]
    NoNodes,
    /// Loopback ports could not be reserved.
    #[error("failed to allocate probe ports: {source}")]
    PortAllocation {
        /// Underlying socket error.
        #[source]
        source: Arc<io::Error>,
    },
    /// No usable configuration could be built.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The run configuration could not be written.
    #[error("failed to write probe configuration in {path}: {source}")]
    ConfigWrite {
        /// Directory the configuration was written to.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The probe log could not be opened.
    #[error("failed to open probe log {path}: {source}")]
    LogOpen {
        /// Log path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The engine process could not be spawned.
    #[error("failed to spawn probe engine {binary}: {source}")]
    Spawn {
        /// Resolved binary.
        binary: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The exit monitor thread could not be started.
    #[error("failed to start probe exit monitor: {source}")]
    Monitor {
        /// Underlying thread spawn error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The control API did not answer in time.
    #[error("probe control API on port {port} not ready after {timeout:?}")]
    ReadinessTimeout {
        /// Control API port.
        port: u16,
        /// Bound that elapsed.
        timeout: Duration,
    },
    /// The engine exited before it became ready.
    #[error("probe engine exited during startup: {status}")]
    ExitedDuringStartup {
        /// Exit status description.
        status: String,
    },
}
