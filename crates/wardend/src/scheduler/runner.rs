//! The two periodic loops and their controller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::SCHEDULER_TARGET;
use super::errors::{SchedulerError, StartStatus};
use super::hooks::{HookError, ScheduleHooks};
use super::signals::{LoopSignals, ResetOutcome, Wake};
use crate::events::{EventBus, EventKind};
use crate::store::{PipelineLog, Store, VerificationLog};
use crate::verify::VerifyError;

/// Length of one configured interval minute.
pub const DEFAULT_INTERVAL_UNIT: Duration = Duration::from_secs(60);

/// Fallback horizon for intervals too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Default)]
struct SchedulerState {
    running: bool,
    signals: Option<Arc<LoopSignals>>,
    workers: Vec<JoinHandle<()>>,
    subscription_interval: Option<Duration>,
    verification_interval: Option<Duration>,
    next_subscription: Option<OffsetDateTime>,
    next_verification: Option<OffsetDateTime>,
    last_verification: Option<OffsetDateTime>,
}

struct Shared {
    store: Arc<dyn Store>,
    hooks: Arc<dyn ScheduleHooks>,
    events: Arc<EventBus>,
    state: Mutex<SchedulerState>,
}

/// Drives the subscription refresh and verification loops.
///
/// Each enabled loop runs on its own worker thread. Both loops share one
/// cancellation token, and [`Scheduler::stop`] joins every worker before it
/// returns. Runtime state sits behind a single mutex and is only exposed
/// through accessors.
pub struct Scheduler {
    shared: Arc<Shared>,
    interval_unit: Duration,
    transition: Mutex<()>,
}

impl Scheduler {
    /// Builds a stopped scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        hooks: Arc<dyn ScheduleHooks>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                hooks,
                events,
                state: Mutex::new(SchedulerState::default()),
            }),
            interval_unit: DEFAULT_INTERVAL_UNIT,
            transition: Mutex::new(()),
        }
    }

    /// Overrides the length of one configured interval minute.
    #[must_use]
    pub fn with_interval_unit(mut self, unit: Duration) -> Self {
        self.interval_unit = unit;
        self
    }

    /// Reads the interval settings and starts every enabled loop.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] when the settings cannot be read or a
    /// worker cannot be spawned. A partially started scheduler is stopped
    /// again before the error is returned.
    pub fn start(&self) -> Result<StartStatus, SchedulerError> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.lock().running {
            debug!(target: SCHEDULER_TARGET, "scheduler already running");
            return Ok(StartStatus::AlreadyRunning);
        }

        let settings = self
            .shared
            .store
            .settings()
            .map_err(|source| SchedulerError::Settings { source })?;
        let subscription = self.interval(settings.subscription_interval_minutes);
        let verification = self.interval(settings.verification_interval_minutes);

        {
            let mut state = self.shared.lock();
            state.subscription_interval = subscription;
            state.verification_interval = verification;
            if subscription.is_none() && verification.is_none() {
                info!(target: SCHEDULER_TARGET, "all scheduled loops disabled");
                return Ok(StartStatus::AllDisabled);
            }
            state.running = true;
            state.next_subscription = subscription.and_then(wall_clock_after);
            state.next_verification = verification.and_then(wall_clock_after);
        }

        let signals = Arc::new(LoopSignals::new());
        let mut workers = Vec::new();
        let spawned = self
            .spawn_loop(subscription, "subscription", &signals, subscription_loop)
            .and_then(|worker| {
                workers.extend(worker);
                self.spawn_loop(verification, "verification", &signals, verification_loop)
            });
        match spawned {
            Ok(worker) => workers.extend(worker),
            Err(error) => {
                signals.cancel();
                join_workers(workers);
                let mut state = self.shared.lock();
                state.running = false;
                state.next_subscription = None;
                state.next_verification = None;
                return Err(error);
            }
        }

        {
            let mut state = self.shared.lock();
            state.signals = Some(signals);
            state.workers = workers;
        }
        let status = StartStatus::Running {
            subscription: subscription.is_some(),
            verification: verification.is_some(),
        };
        info!(
            target: SCHEDULER_TARGET,
            status = %status,
            subscription_interval = ?subscription,
            verification_interval = ?verification,
            "scheduler started"
        );
        Ok(status)
    }

    /// Cancels both loops and waits for them to finish their current
    /// iteration. Does nothing when stopped.
    pub fn stop(&self) {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        let (signals, workers) = {
            let mut state = self.shared.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.next_subscription = None;
            state.next_verification = None;
            (state.signals.take(), std::mem::take(&mut state.workers))
        };
        if let Some(signals) = signals {
            signals.cancel();
        }
        join_workers(workers);
        info!(target: SCHEDULER_TARGET, "scheduler stopped");
    }

    /// Stops and starts again with freshly read settings.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] under the same conditions as
    /// [`Scheduler::start`].
    pub fn restart(&self) -> Result<StartStatus, SchedulerError> {
        self.stop();
        self.start()
    }

    /// Makes the verification loop schedule its next run one interval from
    /// now.
    #[must_use]
    pub fn reset_verification_timer(&self) -> ResetOutcome {
        let state = self.shared.lock();
        match (&state.signals, state.verification_interval) {
            (Some(signals), Some(_)) if state.running => signals.request_reset(),
            _ => ResetOutcome::NotRunning,
        }
    }

    /// Resets the verification timer, then runs one verification on the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// Returns the [`HookError`] of the verify callback.
    pub fn trigger_verification(&self) -> Result<VerificationLog, HookError> {
        let reset = self.reset_verification_timer();
        debug!(target: SCHEDULER_TARGET, ?reset, "manual verification requested");
        let result = self.shared.hooks.verify();
        self.shared.lock().last_verification = Some(OffsetDateTime::now_utc());
        result
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// When the subscription loop fires next.
    #[must_use]
    pub fn next_subscription_update(&self) -> Option<OffsetDateTime> {
        self.shared.lock().next_subscription
    }

    /// When the verification loop fires next.
    #[must_use]
    pub fn next_verification(&self) -> Option<OffsetDateTime> {
        self.shared.lock().next_verification
    }

    /// When the most recent verification finished.
    #[must_use]
    pub fn last_verification(&self) -> Option<OffsetDateTime> {
        self.shared.lock().last_verification
    }

    /// Subscription refresh interval, `None` when disabled.
    #[must_use]
    pub fn subscription_interval(&self) -> Option<Duration> {
        self.shared.lock().subscription_interval
    }

    /// Verification interval, `None` when disabled.
    #[must_use]
    pub fn verification_interval(&self) -> Option<Duration> {
        self.shared.lock().verification_interval
    }

    fn interval(&self, minutes: u64) -> Option<Duration> {
        (minutes > 0).then(|| {
            self.interval_unit
                .saturating_mul(u32::try_from(minutes).unwrap_or(u32::MAX))
        })
    }

    fn spawn_loop(
        &self,
        interval: Option<Duration>,
        worker: &'static str,
        signals: &Arc<LoopSignals>,
        body: fn(&Shared, &LoopSignals, Duration),
    ) -> Result<Option<JoinHandle<()>>, SchedulerError> {
        let Some(interval) = interval else {
            return Ok(None);
        };
        let shared = Arc::clone(&self.shared);
        let signals = Arc::clone(signals);
        thread::Builder::new()
            .name(format!("warden-{worker}"))
            .spawn(move || body(&shared, &signals, interval))
            .map(Some)
            .map_err(|source| SchedulerError::Spawn {
                worker,
                source: Arc::new(source),
            })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_subscriptions(&self) {
        if let Err(error) = self.hooks.refresh_subscriptions() {
            warn!(target: SCHEDULER_TARGET, %error, "scheduled subscription refresh failed");
            return;
        }
        info!(target: SCHEDULER_TARGET, "subscriptions refreshed");
        if let Err(error) = self.hooks.subscriptions_updated() {
            warn!(target: SCHEDULER_TARGET, %error, "subscription update callback failed");
        }
        match self.store.settings() {
            Ok(settings) if settings.auto_pipeline => self.run_pipeline(),
            Ok(_) => {}
            Err(error) => {
                warn!(target: SCHEDULER_TARGET, %error, "auto pipeline skipped");
            }
        }
    }

    fn run_pipeline(&self) {
        let started_at = OffsetDateTime::now_utc();
        let clock = Instant::now();
        self.events
            .publish(EventKind::PipelineStart, json!({ "trigger": "subscription" }));
        let log = self.hooks.pipeline().unwrap_or_else(|error| {
            warn!(target: SCHEDULER_TARGET, %error, "auto pipeline failed");
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
            PipelineLog::failed(started_at, duration_ms, error.to_string())
        });
        if let Err(error) = self.store.append_pipeline_log(&log) {
            warn!(target: SCHEDULER_TARGET, %error, "failed to append pipeline log");
        }
        self.events.publish(
            EventKind::PipelineStop,
            json!({
                "copied": log.copied,
                "skipped": log.skipped,
                "removed": log.removed,
                "duration_ms": log.duration_ms,
                "error": log.error,
            }),
        );
    }

    fn verify(&self) {
        match self.hooks.verify() {
            Ok(log) => debug!(
                target: SCHEDULER_TARGET,
                checked = log.checked,
                "scheduled verification finished"
            ),
            Err(HookError::Verify(VerifyError::AlreadyRunning)) => {
                debug!(
                    target: SCHEDULER_TARGET,
                    "scheduled verification skipped; a run is in progress"
                );
            }
            Err(error) => {
                warn!(target: SCHEDULER_TARGET, %error, "scheduled verification failed");
            }
        }
        self.lock().last_verification = Some(OffsetDateTime::now_utc());
    }
}

fn subscription_loop(shared: &Shared, signals: &LoopSignals, interval: Duration) {
    let mut deadline = instant_after(Instant::now(), interval);
    loop {
        match signals.wait_until(deadline, false) {
            Wake::Cancelled => break,
            Wake::Reset => {}
            Wake::Tick => {
                shared.refresh_subscriptions();
                deadline = next_deadline(deadline, interval);
                shared.lock().next_subscription = wall_clock_at(deadline);
            }
        }
    }
    debug!(target: SCHEDULER_TARGET, "subscription loop exited");
}

fn verification_loop(shared: &Shared, signals: &LoopSignals, interval: Duration) {
    let mut deadline = instant_after(Instant::now(), interval);
    loop {
        match signals.wait_until(deadline, true) {
            Wake::Cancelled => break,
            Wake::Reset => {
                deadline = instant_after(Instant::now(), interval);
                shared.lock().next_verification = wall_clock_at(deadline);
                debug!(target: SCHEDULER_TARGET, "verification timer reset");
            }
            Wake::Tick => {
                shared.verify();
                deadline = next_deadline(deadline, interval);
                shared.lock().next_verification = wall_clock_at(deadline);
            }
        }
    }
    debug!(target: SCHEDULER_TARGET, "verification loop exited");
}

fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            warn!(target: SCHEDULER_TARGET, "scheduler worker panicked");
        }
    }
}

/// Advances a ticker by one interval, skipping ticks missed while a run was
/// in progress.
fn next_deadline(previous: Instant, interval: Duration) -> Instant {
    let now = Instant::now();
    let next = instant_after(previous, interval);
    if next <= now {
        instant_after(now, interval)
    } else {
        next
    }
}

fn instant_after(from: Instant, interval: Duration) -> Instant {
    from.checked_add(interval)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn wall_clock_after(interval: Duration) -> Option<OffsetDateTime> {
    let offset = time::Duration::try_from(interval).ok()?;
    OffsetDateTime::now_utc().checked_add(offset)
}

fn wall_clock_at(deadline: Instant) -> Option<OffsetDateTime> {
    wall_clock_after(deadline.saturating_duration_since(Instant::now()))
}
