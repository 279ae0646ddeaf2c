//! Ownership of the single probe engine instance.

use std::collections::{BTreeSet, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};
use tempfile::TempPath;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use warden_config::{Config, RuntimePaths};

use super::PROBE_TARGET;
use super::document::ProbeLayout;
use super::engine::Engine;
use super::errors::ProbeError;
use super::parser::{EngineErrorParser, ErrorParser};
use super::ports::allocate_port_pair;
use super::process::ProbeProcess;
use super::tags::ProbeTagMap;
use super::validate::{BrokenNode, CheckError, ConfigCheck, validate_nodes};
use crate::events::{EventBus, EventKind};
use crate::store::{NodeKey, UnifiedNode};

/// Interval between control API readiness polls.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables of the probe manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    /// URL the auto-selecting group tests against.
    pub health_url: String,
    /// Bound on the readiness wait.
    pub readiness_timeout: Duration,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl ProbeOptions {
    /// Options taken from the daemon configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            health_url: config.health_check_url().to_owned(),
            readiness_timeout: config.readiness_timeout(),
            poll_interval: READINESS_POLL_INTERVAL,
            stop_grace: config.stop_grace(),
        }
    }
}

/// Handle on a running probe, shared with measurement code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSession {
    /// Control API port.
    pub control_port: u16,
    /// Auxiliary mixed inbound port.
    pub mixed_port: u16,
    /// Probe tags of the accepted nodes.
    pub tags: Arc<ProbeTagMap>,
    /// Nodes excluded during validation.
    pub broken: Arc<[BrokenNode]>,
}

impl ProbeSession {
    /// Validation error of `key`, if the node was excluded.
    #[must_use]
    pub fn broken_reason(&self, key: &NodeKey) -> Option<&str> {
        self.broken
            .iter()
            .find(|node| &node.key == key)
            .map(|node| node.error.as_str())
    }
}

/// Snapshot of the probe's runtime state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStatus {
    /// Whether an instance is alive.
    pub running: bool,
    /// Control API port.
    pub control_port: Option<u16>,
    /// Auxiliary mixed inbound port.
    pub mixed_port: Option<u16>,
    /// Process id.
    pub pid: Option<u32>,
    /// Number of nodes loaded into the instance.
    pub node_count: usize,
    /// Start time.
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// Temporary configuration of the instance.
    pub config_path: Option<PathBuf>,
}

struct RunningProbe {
    process: ProbeProcess,
    session: ProbeSession,
    identities: BTreeSet<NodeKey>,
    started_at: OffsetDateTime,
}

#[derive(Default)]
struct ProbeState {
    generation: u64,
    current: Option<RunningProbe>,
}

/// Starts, reuses and stops the single probe engine instance.
///
/// All state sits behind one mutex. Identity comparison, teardown of the
/// previous instance and startup of the next one happen under that lock, so
/// concurrent callers never race to restart the probe.
pub struct ProbeManager {
    engine: Arc<dyn Engine>,
    parser: Arc<dyn ErrorParser>,
    work_dir: PathBuf,
    log_path: PathBuf,
    options: ProbeOptions,
    events: Arc<EventBus>,
    state: Arc<Mutex<ProbeState>>,
}

impl ProbeManager {
    /// Builds a manager writing configurations and logs under `paths`.
    #[must_use]
    pub fn new(
        engine: Arc<dyn Engine>,
        paths: &RuntimePaths,
        options: ProbeOptions,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            engine,
            parser: Arc::new(EngineErrorParser),
            work_dir: paths.work_dir().to_path_buf(),
            log_path: paths.probe_log_path().to_path_buf(),
            options,
            events,
            state: Arc::new(Mutex::new(ProbeState::default())),
        }
    }

    /// Replaces the check-output parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn ErrorParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Returns the running session when it was started for the same node
    /// identities, otherwise restarts the probe for `nodes`.
    ///
    /// Repeated identities keep their first occurrence. Indices reported in
    /// [`ProbeSession::broken`] refer to that de-duplicated list.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when a restart is needed and fails.
    pub fn ensure_running(&self, nodes: &[UnifiedNode]) -> Result<ProbeSession, ProbeError> {
        let nodes = distinct_nodes(nodes);
        let identities: BTreeSet<NodeKey> = nodes.iter().map(UnifiedNode::key).collect();
        let mut state = self.lock();
        if let Some(running) = &state.current
            && running.identities == identities
        {
            debug!(
                target: PROBE_TARGET,
                nodes = identities.len(),
                "reusing running probe"
            );
            return Ok(running.session.clone());
        }
        self.start_locked(&mut state, nodes, identities)
    }

    /// Stops any running probe and starts a fresh one for `nodes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the engine is missing, ports cannot be
    /// allocated, no node survives validation, or the engine does not become
    /// ready in time.
    pub fn start(&self, nodes: &[UnifiedNode]) -> Result<ProbeSession, ProbeError> {
        let nodes = distinct_nodes(nodes);
        let identities = nodes.iter().map(UnifiedNode::key).collect();
        let mut state = self.lock();
        self.start_locked(&mut state, nodes, identities)
    }

    /// Stops the running probe, if any. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        self.stop_locked(&mut state);
    }

    /// Snapshot of the probe's runtime state.
    #[must_use]
    pub fn status(&self) -> ProbeStatus {
        let state = self.lock();
        state
            .current
            .as_ref()
            .map_or_else(ProbeStatus::default, |running| ProbeStatus {
                running: true,
                control_port: Some(running.session.control_port),
                mixed_port: Some(running.session.mixed_port),
                pid: Some(running.process.pid()),
                node_count: running.session.tags.len(),
                started_at: Some(running.started_at),
                config_path: running.process.config_path().map(Path::to_path_buf),
            })
    }

    /// Whether an instance is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().current.is_some()
    }

    fn start_locked(
        &self,
        state: &mut ProbeState,
        nodes: Vec<UnifiedNode>,
        identities: BTreeSet<NodeKey>,
    ) -> Result<ProbeSession, ProbeError> {
        self.stop_locked(state);
        if nodes.is_empty() {
            return Err(ProbeError::NoNodes);
        }
        self.engine.locate()?;

        let (control_port, mixed_port) =
            allocate_port_pair().map_err(|source| ProbeError::PortAllocation {
                source: Arc::new(source),
            })?;
        let layout = ProbeLayout::new(control_port, mixed_port, self.options.health_url.clone());
        let checker = EngineCheck {
            engine: self.engine.as_ref(),
            work_dir: &self.work_dir,
        };
        let validated = validate_nodes(&nodes, &layout, &checker, self.parser.as_ref())?;
        let (document, tags) = layout.render_with_tags(validated.accepted(&nodes));
        let config = write_document(&self.work_dir, "probe-", &document).map_err(|source| {
            ProbeError::ConfigWrite {
                path: self.work_dir.clone(),
                source: Arc::new(source),
            }
        })?;

        let child = self.engine.spawn(&config, &self.log_path)?;
        state.generation += 1;
        let on_exit = self.exit_monitor(state.generation);
        let mut process = ProbeProcess::watch(child, config, on_exit)?;
        if let Err(error) = self.await_ready(&mut process, control_port) {
            warn!(target: PROBE_TARGET, %error, "probe failed to start");
            process.stop(self.options.stop_grace);
            return Err(error);
        }

        let session = ProbeSession {
            control_port,
            mixed_port,
            tags: Arc::new(tags),
            broken: validated.broken.into(),
        };
        info!(
            target: PROBE_TARGET,
            pid = process.pid(),
            control_port,
            mixed_port,
            nodes = session.tags.len(),
            broken = session.broken.len(),
            iterations = validated.iterations,
            "probe started"
        );
        self.events.publish(
            EventKind::ProbeStart,
            json!({
                "pid": process.pid(),
                "control_port": control_port,
                "mixed_port": mixed_port,
                "nodes": session.tags.len(),
                "broken": session.broken.len(),
            }),
        );
        state.current = Some(RunningProbe {
            process,
            session: session.clone(),
            identities,
            started_at: OffsetDateTime::now_utc(),
        });
        Ok(session)
    }

    fn stop_locked(&self, state: &mut ProbeState) {
        state.generation += 1;
        let Some(mut running) = state.current.take() else {
            return;
        };
        running.process.stop(self.options.stop_grace);
        info!(target: PROBE_TARGET, pid = running.process.pid(), "probe stopped");
        self.events.publish(
            EventKind::ProbeStop,
            json!({ "pid": running.process.pid(), "reason": "stopped" }),
        );
    }

    fn await_ready(&self, process: &mut ProbeProcess, port: u16) -> Result<(), ProbeError> {
        // A timeout past the clock's range waits without a deadline.
        let deadline = Instant::now().checked_add(self.options.readiness_timeout);
        loop {
            if self.engine.is_ready(port) {
                return Ok(());
            }
            if let Some(status) = process.exit_status() {
                return Err(ProbeError::ExitedDuringStartup {
                    status: status.to_owned(),
                });
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ProbeError::ReadinessTimeout {
                    port,
                    timeout: self.options.readiness_timeout,
                });
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Clears the state when generation `generation` is still current once
    /// its process exits.
    fn exit_monitor(&self, generation: u64) -> impl FnOnce(&str) + Send + 'static {
        let state = Arc::downgrade(&self.state);
        let events = Arc::clone(&self.events);
        move |status: &str| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let stale = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.generation == generation {
                    guard.current.take()
                } else {
                    None
                }
            };
            if let Some(running) = stale {
                warn!(
                    target: PROBE_TARGET,
                    pid = running.process.pid(),
                    %status,
                    "probe exited unexpectedly"
                );
                events.publish(
                    EventKind::ProbeStop,
                    json!({ "pid": running.process.pid(), "reason": "exited", "status": status }),
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProbeManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Checks rendered documents by writing them to the work directory.
struct EngineCheck<'a> {
    engine: &'a dyn Engine,
    work_dir: &'a Path,
}

impl ConfigCheck for EngineCheck<'_> {
    fn check(&self, document: &Value) -> Result<(), CheckError> {
        let config = write_document(self.work_dir, "probe-check-", document).map_err(|error| {
            CheckError::Unavailable {
                message: format!("failed to write check configuration: {error}"),
            }
        })?;
        self.engine.check(&config)
    }
}

fn write_document(dir: &Path, prefix: &str, document: &Value) -> io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".json")
        .tempfile_in(dir)?;
    serde_json::to_writer_pretty(&mut file, document)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

/// Keeps the first node of every identity.
fn distinct_nodes(nodes: &[UnifiedNode]) -> Vec<UnifiedNode> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter(|node| seen.insert(node.key()))
        .cloned()
        .collect()
}
