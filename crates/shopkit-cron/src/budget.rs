use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fraction of the hard execution-time limit a pass may spend before it
/// stops starting new work.
const SAFE_ALLOWANCE: f64 = 0.8;

/// Tracks how much of a cron pass's execution-time allowance is left.
///
/// The host environment may kill the process outright at the hard limit;
/// stopping at 80% of it leaves room to finish the in-flight item and the
/// reconciliation sweep instead of dying mid-claim.
#[derive(Clone)]
pub struct TimeBudget {
    started: Instant,
    safe_limit: Option<Duration>,
    /// Test clock. None in production, which reads the system monotonic clock.
    clock: Option<Arc<dyn Fn() -> Instant + Send + Sync>>,
}

impl TimeBudget {
    /// Start a budget for this pass. A `limit_seconds` of 0 means unlimited.
    pub fn new(limit_seconds: u64) -> Self {
        Self {
            started: Instant::now(),
            safe_limit: safe_limit(limit_seconds),
            clock: None,
        }
    }

    /// Like [`TimeBudget::new`] but reading the current instant from `clock`
    /// instead of the system clock, so tests can advance time by hand.
    pub fn with_clock(
        limit_seconds: u64,
        clock: Arc<dyn Fn() -> Instant + Send + Sync>,
    ) -> Self {
        Self {
            started: clock(),
            safe_limit: safe_limit(limit_seconds),
            clock: Some(clock),
        }
    }

    /// True while there is still time to safely start another item.
    pub fn has_time_remaining(&self) -> bool {
        let Some(limit) = self.safe_limit else {
            return true;
        };
        self.now().duration_since(self.started) < limit
    }

    fn now(&self) -> Instant {
        match &self.clock {
            Some(clock) => clock(),
            None => Instant::now(),
        }
    }
}

fn safe_limit(limit_seconds: u64) -> Option<Duration> {
    if limit_seconds == 0 {
        return None;
    }
    Some(Duration::from_secs(
        (limit_seconds as f64 * SAFE_ALLOWANCE).round() as u64,
    ))
}

impl fmt::Debug for TimeBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeBudget")
            .field("started", &self.started)
            .field("safe_limit", &self.safe_limit)
            .finish()
    }
}
