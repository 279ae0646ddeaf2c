//! Cancellation and timer-reset coordination shared by the scheduler loops.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Result of asking the verification loop to restart its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The reset was queued for the verification loop.
    Queued,
    /// A reset was already pending; this one was dropped.
    Dropped,
    /// No verification loop is running.
    NotRunning,
}

/// Why a loop woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The deadline passed.
    Tick,
    /// A timer reset was consumed.
    Reset,
    /// The scheduler is stopping.
    Cancelled,
}

#[derive(Debug, Default)]
struct SignalState {
    cancelled: bool,
    reset_pending: bool,
}

/// One cancellation token plus a capacity-one reset slot.
#[derive(Debug, Default)]
pub(crate) struct LoopSignals {
    state: Mutex<SignalState>,
    wake: Condvar,
}

impl LoopSignals {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Cancels every loop waiting on these signals.
    pub(crate) fn cancel(&self) {
        self.lock().cancelled = true;
        self.wake.notify_all();
    }

    /// Queues a timer reset unless one is already pending.
    pub(crate) fn request_reset(&self) -> ResetOutcome {
        let mut state = self.lock();
        if state.reset_pending {
            return ResetOutcome::Dropped;
        }
        state.reset_pending = true;
        drop(state);
        self.wake.notify_all();
        ResetOutcome::Queued
    }

    /// Blocks until `deadline`, cancellation, or (when `accept_reset` is set)
    /// a pending reset, whichever comes first.
    pub(crate) fn wait_until(&self, deadline: Instant, accept_reset: bool) -> Wake {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Wake::Cancelled;
            }
            if accept_reset && state.reset_pending {
                state.reset_pending = false;
                return Wake::Reset;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Tick;
            }
            state = match self.wake.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
