//! Retry, timeout and cancellation policy for step execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// What to do with a step that did not succeed and did not suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Leave the step in progress; it re-runs on the next pass.
    Retry,
    /// The step used up its error budget.
    ThresholdReached,
    /// The step has been in progress for longer than its timeout.
    TimedOut,
}

/// Error threshold for a step: step override, then runner default, then engine default.
///
/// Zero at any level means "not set".
pub fn effective_error_threshold(
    step_override: Option<u32>,
    runner_default: Option<u32>,
    engine_default: u32,
) -> u32 {
    step_override
        .filter(|n| *n > 0)
        .or(runner_default.filter(|n| *n > 0))
        .unwrap_or(engine_default)
        .max(1)
}

/// Timeout for a step. `None` means unlimited.
///
/// A step override replaces the runner default entirely, so a zero override
/// disables a runner's timeout.
pub fn effective_timeout(
    step_override: Option<Duration>,
    runner_default: Option<Duration>,
) -> Option<Duration> {
    step_override
        .or(runner_default)
        .filter(|timeout| !timeout.is_zero())
}

/// True when `timeout` has elapsed between `started_at` and `now`.
pub fn timed_out(started_at: DateTime<Utc>, timeout: Option<Duration>, now: DateTime<Utc>) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    let elapsed = now.signed_duration_since(started_at);
    elapsed.to_std().map(|e| e >= timeout).unwrap_or(false)
}

/// Decide the fate of a failed attempt. `error_count` already includes it.
pub fn evaluate_failure(
    error_count: u32,
    threshold: u32,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    now: DateTime<Utc>,
) -> FailureVerdict {
    if error_count >= threshold {
        return FailureVerdict::ThresholdReached;
    }
    if timed_out(started_at, timeout, now) {
        return FailureVerdict::TimedOut;
    }
    FailureVerdict::Retry
}

/// Cooperative cancellation flag shared between a caller and a running pass.
///
/// The engine checks it between steps; a step already running is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
