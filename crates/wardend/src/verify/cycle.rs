//! One end-to-end verification cycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::Instant;

use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use warden_config::Config;

use super::VERIFY_TARGET;
use super::errors::VerifyError;
use super::lifecycle::{Evaluation, Transition, evaluate};
use super::measure::{MeasureError, Measurer};
use crate::events::{EventBus, EventKind, VerifyPhase};
use crate::probe::{ProbeManager, ProbeSession};
use crate::store::{
    HealthMeasurement, MeasureKind, NodeKey, NodeStatus, Store, UnifiedNode, VerificationLog,
};

/// URLs the verifier measures against and how many nodes it measures at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierOptions {
    /// Latency test target.
    pub health_url: String,
    /// Geolocation lookup service.
    pub geo_lookup_url: String,
    /// Threads measuring nodes concurrently; zero is treated as one.
    pub check_workers: usize,
}

impl VerifierOptions {
    /// Options taken from the daemon configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            health_url: config.health_check_url().to_owned(),
            geo_lookup_url: config.geo_lookup_url().to_owned(),
            check_workers: config.check_workers(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    checked: usize,
    promoted: usize,
    demoted: usize,
    archived: usize,
}

/// Runs verification cycles against the store's pending and verified nodes.
///
/// Cycles never overlap; a run requested while another is in progress fails
/// with [`VerifyError::AlreadyRunning`]. Lifecycle state is read from the
/// store at the start of every cycle and never cached between cycles.
pub struct Verifier {
    store: Arc<dyn Store>,
    probe: Arc<ProbeManager>,
    measurer: Arc<dyn Measurer>,
    events: Arc<EventBus>,
    options: VerifierOptions,
    gate: Mutex<()>,
}

impl Verifier {
    /// Builds a verifier over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        probe: Arc<ProbeManager>,
        measurer: Arc<dyn Measurer>,
        events: Arc<EventBus>,
        options: VerifierOptions,
    ) -> Self {
        Self {
            store,
            probe,
            measurer,
            events,
            options,
            gate: Mutex::new(()),
        }
    }

    /// Runs one cycle and returns the log it persisted.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`] when settings or nodes cannot be loaded or the
    /// probe cannot start. The failure is persisted as a log with an error
    /// and zeroed counts before it is returned.
    pub fn run(&self) -> Result<VerificationLog, VerifyError> {
        let _cycle = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(target: VERIFY_TARGET, "verification already in progress");
                return Err(VerifyError::AlreadyRunning);
            }
        };

        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        info!(target: VERIFY_TARGET, "verification cycle started");
        self.events.publish(EventKind::VerifyStart, json!({}));

        let result = self.cycle();
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(tally) => {
                let log = VerificationLog {
                    started_at,
                    duration_ms,
                    checked: tally.checked,
                    promoted: tally.promoted,
                    demoted: tally.demoted,
                    archived: tally.archived,
                    error: None,
                };
                self.persist(&log);
                info!(
                    target: VERIFY_TARGET,
                    checked = log.checked,
                    promoted = log.promoted,
                    demoted = log.demoted,
                    archived = log.archived,
                    duration_ms,
                    "verification cycle completed"
                );
                self.events.publish(
                    EventKind::VerifyComplete,
                    json!({
                        "checked": log.checked,
                        "promoted": log.promoted,
                        "demoted": log.demoted,
                        "archived": log.archived,
                        "duration_ms": duration_ms,
                    }),
                );
                Ok(log)
            }
            Err(error) => {
                let log = VerificationLog::failed(started_at, duration_ms, error.to_string());
                self.persist(&log);
                warn!(target: VERIFY_TARGET, %error, duration_ms, "verification cycle failed");
                self.events.publish(
                    EventKind::VerifyError,
                    json!({ "error": error.to_string(), "duration_ms": duration_ms }),
                );
                Err(error)
            }
        }
    }

    fn cycle(&self) -> Result<Tally, VerifyError> {
        let settings = self
            .store
            .settings()
            .map_err(|source| VerifyError::Settings { source })?;
        let pending = self.load(NodeStatus::Pending)?;
        let verified = self.load(NodeStatus::Verified)?;
        self.progress(
            VerifyPhase::PendingScan,
            json!({ "pending": pending.len(), "verified": verified.len() }),
        );

        let nodes: Vec<UnifiedNode> = pending.into_iter().chain(verified).collect();
        if nodes.is_empty() {
            info!(target: VERIFY_TARGET, "no pending or verified nodes to check");
            return Ok(Tally::default());
        }

        let session = self.probe.ensure_running(&nodes)?;
        let mut outcomes = self.health_checks(&session, &nodes);
        if !settings.site_check_urls.is_empty() {
            self.site_checks(&session, &nodes, &settings.site_check_urls, &mut outcomes);
        }
        let tally = self.apply_transitions(&nodes, &outcomes, settings.archive_threshold);
        if settings.geo_detection {
            self.detect_geo(&session);
        }
        Ok(tally)
    }

    fn load(&self, status: NodeStatus) -> Result<Vec<UnifiedNode>, VerifyError> {
        self.store
            .nodes_with_status(status)
            .map_err(|source| VerifyError::LoadNodes { status, source })
    }

    fn health_checks(&self, session: &ProbeSession, nodes: &[UnifiedNode]) -> Vec<bool> {
        let total = nodes.len();
        let done = AtomicUsize::new(0);
        self.in_parallel(nodes, |node| {
            let key = node.key();
            let result = self.measure_delay(session, &key, &self.options.health_url);
            self.record(&key, MeasureKind::Health, &result);
            self.progress(
                VerifyPhase::HealthCheck,
                json!({
                    "done": done.fetch_add(1, Ordering::Relaxed) + 1,
                    "total": total,
                    "node": key.to_string(),
                    "ok": result.is_ok(),
                }),
            );
            result.is_ok()
        })
    }

    /// A healthy node stays successful only if at least one site answers.
    fn site_checks(
        &self,
        session: &ProbeSession,
        nodes: &[UnifiedNode],
        urls: &[String],
        outcomes: &mut [bool],
    ) {
        let healthy: Vec<(usize, &UnifiedNode)> = nodes
            .iter()
            .zip(outcomes.iter())
            .enumerate()
            .filter_map(|(index, (node, healthy))| healthy.then_some((index, node)))
            .collect();
        let total = healthy.len();
        let done = AtomicUsize::new(0);
        let reached = self.in_parallel(&healthy, |(_, node)| {
            let key = node.key();
            let mut reachable = 0_usize;
            for url in urls {
                let result = self.measure_delay(session, &key, url);
                self.record(&key, MeasureKind::Site(url.clone()), &result);
                if result.is_ok() {
                    reachable += 1;
                }
            }
            self.progress(
                VerifyPhase::SiteCheck,
                json!({
                    "done": done.fetch_add(1, Ordering::Relaxed) + 1,
                    "total": total,
                    "node": key.to_string(),
                    "reachable": reachable,
                    "sites": urls.len(),
                }),
            );
            reachable > 0
        });
        for ((index, _), ok) in healthy.iter().zip(reached) {
            if let Some(outcome) = outcomes.get_mut(*index) {
                *outcome = ok;
            }
        }
    }

    /// Runs `check` over `items` on the calling thread plus up to
    /// `check_workers - 1` scoped helpers and returns the results in input
    /// order. Items claimed by a helper that panicked count as failed.
    fn in_parallel<T, F>(&self, items: &[T], check: F) -> Vec<bool>
    where
        T: Sync,
        F: Fn(&T) -> bool + Sync,
    {
        let workers = self.options.check_workers.clamp(1, items.len().max(1));
        let next = AtomicUsize::new(0);
        let (next, check) = (&next, &check);
        let mut results = vec![false; items.len()];
        thread::scope(|scope| {
            let helpers: Vec<_> = (1..workers)
                .filter_map(|_| {
                    thread::Builder::new()
                        .name(String::from("warden-verify-check"))
                        .spawn_scoped(scope, move || drain(items, next, check))
                        .inspect_err(|error| {
                            warn!(
                                target: VERIFY_TARGET,
                                %error,
                                "measurement worker not started"
                            );
                        })
                        .ok()
                })
                .collect();
            let mut checked = drain(items, next, check);
            for helper in helpers {
                match helper.join() {
                    Ok(mut more) => checked.append(&mut more),
                    Err(_) => warn!(target: VERIFY_TARGET, "measurement worker panicked"),
                }
            }
            for (index, ok) in checked {
                if let Some(result) = results.get_mut(index) {
                    *result = ok;
                }
            }
        });
        results
    }

    fn apply_transitions(&self, nodes: &[UnifiedNode], outcomes: &[bool], threshold: u32) -> Tally {
        let now = OffsetDateTime::now_utc();
        let mut tally = Tally::default();
        for (node, success) in nodes.iter().zip(outcomes) {
            let key = node.key();
            let failures = self.store.consecutive_failures(&key).unwrap_or_else(|error| {
                warn!(
                    target: VERIFY_TARGET,
                    node = %key,
                    %error,
                    "failed to read failure counter; using loaded value"
                );
                node.consecutive_failures
            });
            let Some(evaluation) = evaluate(node, failures, *success, threshold, now) else {
                continue;
            };
            tally.checked += 1;
            if let Err(error) = self.store.update_lifecycle(&key, &evaluation.update) {
                warn!(
                    target: VERIFY_TARGET,
                    node = %key,
                    transition = ?evaluation.transition,
                    %error,
                    "lifecycle update not applied"
                );
                continue;
            }
            let kind = match evaluation.transition {
                Transition::Promoted => {
                    tally.promoted += 1;
                    EventKind::NodePromoted
                }
                Transition::Demoted => {
                    tally.demoted += 1;
                    EventKind::NodeDemoted
                }
                Transition::Archived => {
                    tally.archived += 1;
                    EventKind::NodeArchived
                }
                Transition::StillPending | Transition::Confirmed | Transition::StillVerified => {
                    continue;
                }
            };
            debug!(
                target: VERIFY_TARGET,
                node = %key,
                transition = ?evaluation.transition,
                "lifecycle transition applied"
            );
            self.events
                .publish_stamped(kind, transition_payload(node, &evaluation));
        }
        tally
    }

    /// Geolocates verified nodes with no cached country, once per address.
    fn detect_geo(&self, session: &ProbeSession) {
        let verified = match self.store.nodes_with_status(NodeStatus::Verified) {
            Ok(nodes) => nodes,
            Err(error) => {
                warn!(target: VERIFY_TARGET, %error, "skipping geolocation");
                return;
            }
        };
        let mut seen = HashSet::new();
        let candidates: Vec<_> = verified
            .into_iter()
            .filter(|node| node.country_code.is_none())
            .filter(|node| seen.insert(node.address.clone()))
            .filter(|node| matches!(self.store.cached_geo(&node.address), Ok(None)))
            .collect();
        let total = candidates.len();
        for (index, node) in candidates.iter().enumerate() {
            let key = node.key();
            let Some(tag) = session.tags.tag_for(&key) else {
                continue;
            };
            let located = match self
                .measurer
                .geolocate(session, tag, &self.options.geo_lookup_url)
            {
                Ok(geo) => match self.store.cache_geo(&node.address, &geo) {
                    Ok(()) => Some(geo.country_code),
                    Err(error) => {
                        warn!(
                            target: VERIFY_TARGET,
                            node = %key,
                            %error,
                            "failed to cache geolocation"
                        );
                        None
                    }
                },
                Err(error) => {
                    debug!(target: VERIFY_TARGET, node = %key, %error, "geolocation failed");
                    None
                }
            };
            self.progress(
                VerifyPhase::GeoDetection,
                json!({
                    "done": index + 1,
                    "total": total,
                    "node": key.to_string(),
                    "country_code": located,
                }),
            );
        }
    }

    fn measure_delay(
        &self,
        session: &ProbeSession,
        key: &NodeKey,
        url: &str,
    ) -> Result<u64, MeasureError> {
        let Some(tag) = session.tags.tag_for(key) else {
            let reason = session
                .broken_reason(key)
                .unwrap_or("not loaded into the probe")
                .to_owned();
            return Err(MeasureError::NotProbed { reason });
        };
        self.measurer.delay(session, tag, url)
    }

    fn record(&self, key: &NodeKey, kind: MeasureKind, result: &Result<u64, MeasureError>) {
        let measurement = HealthMeasurement {
            key: key.clone(),
            kind,
            latency_ms: result.as_ref().ok().copied(),
            error: result.as_ref().err().map(ToString::to_string),
            measured_at: OffsetDateTime::now_utc(),
        };
        if let Err(error) = self.store.record_measurement(&measurement) {
            warn!(target: VERIFY_TARGET, node = %key, %error, "failed to record measurement");
        }
    }

    fn persist(&self, log: &VerificationLog) {
        if let Err(error) = self.store.append_verification_log(log) {
            warn!(target: VERIFY_TARGET, %error, "failed to append verification log");
        }
    }

    fn progress(&self, phase: VerifyPhase, mut data: Value) {
        if let Value::Object(map) = &mut data {
            map.insert(String::from("phase"), Value::from(phase.as_str()));
        }
        self.events.publish(EventKind::VerifyProgress, data);
    }
}

/// Claims items off the shared cursor until none remain.
fn drain<T>(items: &[T], next: &AtomicUsize, check: &impl Fn(&T) -> bool) -> Vec<(usize, bool)> {
    let mut checked = Vec::new();
    loop {
        let index = next.fetch_add(1, Ordering::Relaxed);
        let Some(item) = items.get(index) else {
            return checked;
        };
        checked.push((index, check(item)));
    }
}

fn transition_payload(node: &UnifiedNode, evaluation: &Evaluation) -> Value {
    json!({
        "tag": node.tag,
        "address": node.address,
        "port": node.port,
        "status": evaluation.update.status.as_str(),
        "consecutive_failures": evaluation.update.consecutive_failures,
    })
}
