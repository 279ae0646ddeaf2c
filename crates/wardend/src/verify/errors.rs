use thiserror::Error;

use crate::probe::ProbeError;
use crate::store::{NodeStatus, StoreError};

/// Errors that abort a verification cycle.
///
/// Node-level measurement failures never appear here; they are absorbed into
/// the node's failure counter.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Another cycle is in progress.
    #[error("a verification cycle is already running")]
    AlreadyRunning,
    /// Runtime settings could not be read.
    #[error("failed to read settings: {source}")]
    Settings {
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
    /// A node set could not be loaded.
    #[error("failed to load {status} nodes: {source}")]
    LoadNodes {
        /// Status that was queried.
        status: NodeStatus,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
    /// The probe could not be started.
    #[error("probe unavailable: {source}")]
    Probe {
        /// Underlying probe error.
        #[source]
        source: ProbeError,
    },
}

impl From<ProbeError> for VerifyError {
    fn from(source: ProbeError) -> Self {
        Self::Probe { source }
    }
}
