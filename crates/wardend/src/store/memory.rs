//! In-process store used when no external store is attached.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{
    GeoInfo, HealthMeasurement, LifecycleUpdate, NodeKey, NodeStatus, PipelineLog, Settings,
    Store, StoreError, UnifiedNode, VerificationLog,
};

/// Run logs kept per kind by default.
pub const DEFAULT_LOG_RETENTION: usize = 500;
/// Measurements kept by default.
pub const DEFAULT_MEASUREMENT_RETENTION: usize = 10_000;

/// How much history the store keeps before discarding the oldest entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Verification logs and pipeline logs, each.
    pub logs: usize,
    /// Health and site measurements.
    pub measurements: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            logs: DEFAULT_LOG_RETENTION,
            measurements: DEFAULT_MEASUREMENT_RETENTION,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    settings: Settings,
    nodes: BTreeMap<NodeKey, UnifiedNode>,
    verification_logs: VecDeque<VerificationLog>,
    pipeline_logs: VecDeque<PipelineLog>,
    measurements: VecDeque<HealthMeasurement>,
    geo: HashMap<String, GeoInfo>,
    failing_updates: HashSet<NodeKey>,
}

/// Thread-safe store keeping everything in memory.
///
/// Nodes, settings and the geo cache are kept in full. Logs and measurements
/// are bounded by [`Retention`]; once full, each append discards the oldest
/// entry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    retention: Retention,
}

impl MemoryStore {
    /// Builds an empty store with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an empty store with the given settings.
    #[must_use]
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                settings,
                ..MemoryState::default()
            }),
            retention: Retention::default(),
        }
    }

    /// Replaces the history bounds.
    #[must_use]
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Replaces the runtime settings.
    pub fn set_settings(&self, settings: Settings) -> Result<(), StoreError> {
        self.lock()?.settings = settings;
        Ok(())
    }

    /// Inserts or replaces a node, keyed by its identity.
    pub fn upsert_node(&self, node: UnifiedNode) -> Result<(), StoreError> {
        self.lock()?.nodes.insert(node.key(), node);
        Ok(())
    }

    /// Returns the stored node with identity `key`.
    pub fn node(&self, key: &NodeKey) -> Result<Option<UnifiedNode>, StoreError> {
        Ok(self.lock()?.nodes.get(key).cloned())
    }

    /// Snapshot of the verification log.
    pub fn verification_logs(&self) -> Result<Vec<VerificationLog>, StoreError> {
        Ok(self.lock()?.verification_logs.iter().cloned().collect())
    }

    /// Snapshot of the pipeline log.
    pub fn pipeline_logs(&self) -> Result<Vec<PipelineLog>, StoreError> {
        Ok(self.lock()?.pipeline_logs.iter().cloned().collect())
    }

    /// Snapshot of the retained measurements, oldest first.
    pub fn measurements(&self) -> Result<Vec<HealthMeasurement>, StoreError> {
        Ok(self.lock()?.measurements.iter().cloned().collect())
    }

    /// Makes lifecycle updates for `key` fail with a backend error.
    #[cfg(test)]
    pub fn fail_updates_for(&self, key: NodeKey) -> Result<(), StoreError> {
        self.lock()?.failing_updates.insert(key);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Store for MemoryStore {
    fn settings(&self) -> Result<Settings, StoreError> {
        Ok(self.lock()?.settings.clone())
    }

    fn nodes_with_status(&self, status: NodeStatus) -> Result<Vec<UnifiedNode>, StoreError> {
        Ok(self
            .lock()?
            .nodes
            .values()
            .filter(|node| node.status == status)
            .cloned()
            .collect())
    }

    fn consecutive_failures(&self, key: &NodeKey) -> Result<u32, StoreError> {
        self.lock()?
            .nodes
            .get(key)
            .map(|node| node.consecutive_failures)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })
    }

    fn update_lifecycle(&self, key: &NodeKey, update: &LifecycleUpdate) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.failing_updates.contains(key) {
            return Err(StoreError::Backend {
                message: format!("update rejected for {key}"),
            });
        }
        let node = state
            .nodes
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        node.status = update.status;
        node.consecutive_failures = update.consecutive_failures;
        node.last_checked_at = Some(update.checked_at);
        if let Some(promoted_at) = update.promoted_at {
            node.promoted_at = Some(promoted_at);
        }
        if let Some(archived_at) = update.archived_at {
            node.archived_at = Some(archived_at);
        }
        Ok(())
    }

    fn append_verification_log(&self, log: &VerificationLog) -> Result<(), StoreError> {
        let limit = self.retention.logs;
        push_bounded(&mut self.lock()?.verification_logs, log.clone(), limit);
        Ok(())
    }

    fn append_pipeline_log(&self, log: &PipelineLog) -> Result<(), StoreError> {
        let limit = self.retention.logs;
        push_bounded(&mut self.lock()?.pipeline_logs, log.clone(), limit);
        Ok(())
    }

    fn record_measurement(&self, measurement: &HealthMeasurement) -> Result<(), StoreError> {
        let limit = self.retention.measurements;
        push_bounded(&mut self.lock()?.measurements, measurement.clone(), limit);
        Ok(())
    }

    fn cached_geo(&self, address: &str) -> Result<Option<GeoInfo>, StoreError> {
        Ok(self.lock()?.geo.get(address).cloned())
    }

    fn cache_geo(&self, address: &str, geo: &GeoInfo) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.geo.insert(address.to_owned(), geo.clone());
        for node in state.nodes.values_mut().filter(|node| node.address == address) {
            node.country = Some(geo.country.clone());
            node.country_code = Some(geo.country_code.clone());
        }
        Ok(())
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    while queue.len() >= limit {
        queue.pop_front();
    }
    queue.push_back(item);
}
