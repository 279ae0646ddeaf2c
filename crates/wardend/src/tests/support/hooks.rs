//! Scheduler callbacks that count invocations.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use time::OffsetDateTime;

use crate::scheduler::{HookError, ScheduleHooks};
use crate::store::{PipelineLog, VerificationLog};

/// Records every callback and optionally fails some of them.
#[derive(Default)]
pub struct RecordingHooks {
    refreshes: AtomicUsize,
    updates: AtomicUsize,
    pipelines: AtomicUsize,
    verifications: Mutex<Vec<Instant>>,
    fail_refresh: AtomicBool,
    fail_verify: AtomicBool,
    fail_pipeline: AtomicBool,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }

    pub fn fail_verify(&self) {
        self.fail_verify.store(true, Ordering::SeqCst);
    }

    pub fn fail_pipeline(&self) {
        self.fail_pipeline.store(true, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.load(Ordering::SeqCst)
    }

    pub fn verify_count(&self) -> usize {
        self.verifications.lock().expect("verifications lock").len()
    }

    /// Instants at which the verify callback ran.
    pub fn verify_times(&self) -> Vec<Instant> {
        self.verifications.lock().expect("verifications lock").clone()
    }
}

impl ScheduleHooks for RecordingHooks {
    fn refresh_subscriptions(&self) -> Result<(), HookError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(HookError::failed("subscription endpoint unreachable"));
        }
        Ok(())
    }

    fn subscriptions_updated(&self) -> Result<(), HookError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn verify(&self) -> Result<VerificationLog, HookError> {
        self.verifications
            .lock()
            .expect("verifications lock")
            .push(Instant::now());
        if self.fail_verify.load(Ordering::SeqCst) {
            return Err(HookError::failed("probe unavailable"));
        }
        Ok(VerificationLog {
            started_at: OffsetDateTime::now_utc(),
            duration_ms: 1,
            checked: 0,
            promoted: 0,
            demoted: 0,
            archived: 0,
            error: None,
        })
    }

    fn pipeline(&self) -> Result<PipelineLog, HookError> {
        self.pipelines.fetch_add(1, Ordering::SeqCst);
        if self.fail_pipeline.load(Ordering::SeqCst) {
            return Err(HookError::failed("active set locked"));
        }
        Ok(PipelineLog {
            started_at: OffsetDateTime::now_utc(),
            duration_ms: 1,
            copied: 2,
            skipped: 1,
            removed: 0,
            error: None,
        })
    }
}
