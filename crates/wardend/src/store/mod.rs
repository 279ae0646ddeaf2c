//! Store interface consumed by the verification pipeline.
//!
//! The store is the single source of truth for node lifecycle state. The
//! daemon never caches lifecycle fields across cycles: every verification run
//! re-reads node sets and failure counters through this trait. Schema and
//! persistence details belong to the implementation; [`MemoryStore`] is the
//! in-process implementation used when no external store is attached.

mod memory;
mod model;

use std::sync::Arc;

use thiserror::Error;

pub use memory::{DEFAULT_LOG_RETENTION, DEFAULT_MEASUREMENT_RETENTION, MemoryStore, Retention};
pub use model::{
    GeoInfo, HealthMeasurement, LifecycleUpdate, MeasureKind, NodeKey, NodeStatus,
    NodeStatusParseError, PipelineLog, Settings, UnifiedNode, VerificationLog,
};

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No node is stored under the key.
    #[error("node {key} not found")]
    NotFound {
        /// Identity that was looked up.
        key: NodeKey,
    },
    /// Store state was poisoned by a panicking writer.
    #[error("store state poisoned")]
    Poisoned,
    /// The backing implementation rejected the operation.
    #[error("store backend error: {message}")]
    Backend {
        /// Backend-specific description.
        message: String,
    },
}

/// Operations the daemon needs from the persistent store.
pub trait Store: Send + Sync {
    /// Current runtime settings.
    fn settings(&self) -> Result<Settings, StoreError>;

    /// Nodes currently in `status`.
    fn nodes_with_status(&self, status: NodeStatus) -> Result<Vec<UnifiedNode>, StoreError>;

    /// Consecutive failure counter of the node with identity `key`.
    fn consecutive_failures(&self, key: &NodeKey) -> Result<u32, StoreError>;

    /// Writes lifecycle fields of the node with identity `key`.
    fn update_lifecycle(&self, key: &NodeKey, update: &LifecycleUpdate) -> Result<(), StoreError>;

    /// Appends a verification run record.
    fn append_verification_log(&self, log: &VerificationLog) -> Result<(), StoreError>;

    /// Appends a pipeline run record.
    fn append_pipeline_log(&self, log: &PipelineLog) -> Result<(), StoreError>;

    /// Appends one measurement.
    fn record_measurement(&self, measurement: &HealthMeasurement) -> Result<(), StoreError>;

    /// Cached geolocation for a server address.
    fn cached_geo(&self, address: &str) -> Result<Option<GeoInfo>, StoreError>;

    /// Caches the geolocation of a server address.
    fn cache_geo(&self, address: &str, geo: &GeoInfo) -> Result<(), StoreError>;
}

impl<T> Store for Arc<T>
where
    T: Store + ?Sized,
{
    fn settings(&self) -> Result<Settings, StoreError> {
        (**self).settings()
    }

    fn nodes_with_status(&self, status: NodeStatus) -> Result<Vec<UnifiedNode>, StoreError> {
        (**self).nodes_with_status(status)
    }

    fn consecutive_failures(&self, key: &NodeKey) -> Result<u32, StoreError> {
        (**self).consecutive_failures(key)
    }

    fn update_lifecycle(&self, key: &NodeKey, update: &LifecycleUpdate) -> Result<(), StoreError> {
        (**self).update_lifecycle(key, update)
    }

    fn append_verification_log(&self, log: &VerificationLog) -> Result<(), StoreError> {
        (**self).append_verification_log(log)
    }

    fn append_pipeline_log(&self, log: &PipelineLog) -> Result<(), StoreError> {
        (**self).append_pipeline_log(log)
    }

    fn record_measurement(&self, measurement: &HealthMeasurement) -> Result<(), StoreError> {
        (**self).record_measurement(measurement)
    }

    fn cached_geo(&self, address: &str) -> Result<Option<GeoInfo>, StoreError> {
        (**self).cached_geo(address)
    }

    fn cache_geo(&self, address: &str, geo: &GeoInfo) -> Result<(), StoreError> {
        (**self).cache_geo(address, geo)
    }
}
