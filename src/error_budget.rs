//! Legacy error budget: a simple breaker independent of the token buckets.
//!
//! Two signals gate calls:
//! - the upstream's error-budget header pair (`remain`, `reset` seconds), and
//! - a local count of errors seen since the last check, cleared once a full
//!   window (60s) has passed since that check. This is a tumbling counter, not
//!   a true sliding window.
//!
//! Calls are refused while `remain <= min_remaining` or more than
//! `max_errors_per_window` errors were counted. A refused caller waits
//! [`LegacyErrorBudget::reset_wait`] and asks again.
//!
//! State is per instance: two clients never share a budget.

use crate::clock::{Clock, SystemClock};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Shortest wait handed to a refused caller, so a `reset` of 0 cannot spin.
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Thresholds and initial values of the budget.
#[derive(Debug, Clone)]
pub struct ErrorBudgetConfig {
    initial_remain: u32,
    initial_reset: Duration,
    min_remaining: u32,
    max_errors_per_window: u32,
    window: Duration,
}

impl Default for ErrorBudgetConfig {
    fn default() -> Self {
        Self {
            initial_remain: 100,
            initial_reset: Duration::from_secs(60),
            min_remaining: 5,
            max_errors_per_window: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl ErrorBudgetConfig {
    pub fn with_min_remaining(mut self, min_remaining: u32) -> Self {
        self.min_remaining = min_remaining;
        self
    }

    pub fn with_max_errors_per_window(mut self, max_errors: u32) -> Self {
        self.max_errors_per_window = max_errors;
        self
    }

    /// Budget assumed before the upstream reports one.
    pub fn initial_remain(&self) -> u32 {
        self.initial_remain
    }

    /// Calls are refused at or below this remaining budget.
    pub fn min_remaining(&self) -> u32 {
        self.min_remaining
    }

    /// Calls are refused once more errors than this were counted.
    pub fn max_errors_per_window(&self) -> u32 {
        self.max_errors_per_window
    }

    /// Length of the local error-counting window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[derive(Debug)]
struct BudgetState {
    error_limit_remain: u32,
    error_limit_reset: Duration,
    // When the reported budget is expected to refill, if reported.
    remain_resets_at: Option<u64>,
    errors_last_window: u32,
    last_error_check: u64,
    blocked: bool,
}

/// Process-local error budget; clones share state.
#[derive(Debug, Clone)]
pub struct LegacyErrorBudget {
    state: Arc<Mutex<BudgetState>>,
    config: ErrorBudgetConfig,
    clock: Arc<dyn Clock>,
}

impl Default for LegacyErrorBudget {
    fn default() -> Self {
        Self::new(ErrorBudgetConfig::default())
    }
}

impl LegacyErrorBudget {
    pub fn new(config: ErrorBudgetConfig) -> Self {
        Self::with_clock_arc(config, Arc::new(SystemClock))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        Self::with_clock_arc(self.config, Arc::new(clock))
    }

    pub(crate) fn with_clock_arc(config: ErrorBudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let state = BudgetState {
            error_limit_remain: config.initial_remain,
            error_limit_reset: config.initial_reset,
            remain_resets_at: None,
            errors_last_window: 0,
            last_error_check: clock.now_millis(),
            blocked: false,
        };
        Self { state: Arc::new(Mutex::new(state)), config, clock }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may be dispatched now.
    pub fn can_make_request(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        let window_ms = u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(state.last_error_check) >= window_ms {
            state.errors_last_window = 0;
            state.last_error_check = now;
        }
        if state.remain_resets_at.is_some_and(|at| now >= at) {
            state.error_limit_remain = self.config.initial_remain;
            state.remain_resets_at = None;
        }

        let blocked = self.exhausted(&state) || self.too_many_errors(&state);
        if blocked && !state.blocked {
            tracing::warn!(
                remain = state.error_limit_remain,
                errors = state.errors_last_window,
                reset_s = state.error_limit_reset.as_secs(),
                "error budget exhausted; holding requests"
            );
        } else if !blocked && state.blocked {
            tracing::info!(remain = state.error_limit_remain, "error budget recovered");
        }
        state.blocked = blocked;
        !blocked
    }

    fn exhausted(&self, state: &BudgetState) -> bool {
        state.error_limit_remain <= self.config.min_remaining
    }

    fn too_many_errors(&self, state: &BudgetState) -> bool {
        state.errors_last_window > self.config.max_errors_per_window
    }

    /// How long a refused caller should wait before asking again.
    ///
    /// Waits until every blocking condition has lapsed: the reported refill
    /// and the end of the local error window. Never less than one second.
    /// With nothing blocking, this is the last reported reset.
    pub fn reset_wait(&self) -> Duration {
        let now = self.clock.now_millis();
        let state = self.lock();
        let reset_ms = u64::try_from(state.error_limit_reset.as_millis()).unwrap_or(u64::MAX);

        let mut until: Option<u64> = None;
        if self.exhausted(&state) {
            until = Some(state.remain_resets_at.unwrap_or(now.saturating_add(reset_ms)));
        }
        if self.too_many_errors(&state) {
            let window_ms = u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX);
            let window_end = state.last_error_check.saturating_add(window_ms);
            until = Some(until.map_or(window_end, |at| at.max(window_end)));
        }

        let wait = match until {
            Some(at) => Duration::from_millis(at.saturating_sub(now)),
            None => state.error_limit_reset,
        };
        wait.max(MIN_WAIT)
    }

    /// Count one error against the local window.
    pub fn record_error(&self) {
        let mut state = self.lock();
        state.errors_last_window = state.errors_last_window.saturating_add(1);
    }

    /// Adopt the upstream's error-budget headers, whichever are present.
    pub fn update_from_headers(&self, remain: Option<u32>, reset_secs: Option<u32>) {
        if remain.is_none() && reset_secs.is_none() {
            return;
        }
        let now = self.clock.now_millis();
        let mut state = self.lock();
        if let Some(remain) = remain {
            state.error_limit_remain = remain;
        }
        if let Some(reset) = reset_secs {
            state.error_limit_reset = Duration::from_secs(u64::from(reset));
        }
        let reset_ms = u64::try_from(state.error_limit_reset.as_millis()).unwrap_or(u64::MAX);
        state.remain_resets_at = Some(now.saturating_add(reset_ms));
    }

    /// Last reported (or initial) remaining budget.
    pub fn remaining(&self) -> u32 {
        self.lock().error_limit_remain
    }

    /// Errors counted in the current local window.
    pub fn errors_in_window(&self) -> u32 {
        self.lock().errors_last_window
    }
}
