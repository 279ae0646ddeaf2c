//! A verifier wired to in-process doubles.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use warden_config::RuntimePaths;

use super::FakeEngine;
use crate::events::EventBus;
use crate::probe::{ProbeManager, ProbeOptions};
use crate::store::MemoryStore;
use crate::verify::{Measurer, Verifier, VerifierOptions};

/// Health URL the rig's verifier measures against.
pub const HEALTH_URL: &str = "https://health.example/generate_204";
/// Geolocation service URL of the rig.
const GEO_URL: &str = "http://geo.example/json";

/// Verifier over a memory store, a fake engine and a caller-chosen measurer.
pub struct VerifierRig {
    _dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<FakeEngine>,
    pub events: Arc<EventBus>,
    pub probe: Arc<ProbeManager>,
    pub verifier: Arc<Verifier>,
}

impl VerifierRig {
    pub fn new(measurer: Arc<dyn Measurer>) -> Self {
        Self::with_engine(FakeEngine::new(), measurer)
    }

    pub fn with_engine(engine: FakeEngine, measurer: Arc<dyn Measurer>) -> Self {
        Self::build(engine, measurer, 4)
    }

    /// Rig whose verifier measures at most `workers` nodes at once.
    pub fn with_workers(measurer: Arc<dyn Measurer>, workers: usize) -> Self {
        Self::build(FakeEngine::new(), measurer, workers)
    }

    fn build(engine: FakeEngine, measurer: Arc<dyn Measurer>, workers: usize) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let paths = RuntimePaths::in_directory(dir.path()).expect("runtime paths");
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(engine);
        let events = Arc::new(EventBus::default());
        let options = ProbeOptions {
            health_url: HEALTH_URL.to_owned(),
            readiness_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_secs(2),
        };
        let probe = Arc::new(ProbeManager::new(
            engine.clone(),
            &paths,
            options,
            Arc::clone(&events),
        ));
        let verifier = Arc::new(Verifier::new(
            store.clone(),
            Arc::clone(&probe),
            measurer,
            Arc::clone(&events),
            VerifierOptions {
                health_url: HEALTH_URL.to_owned(),
                geo_lookup_url: GEO_URL.to_owned(),
                check_workers: workers,
            },
        ));
        Self {
            _dir: dir,
            store,
            engine,
            events,
            probe,
            verifier,
        }
    }
}

impl Drop for VerifierRig {
    fn drop(&mut self) {
        self.probe.stop();
    }
}
