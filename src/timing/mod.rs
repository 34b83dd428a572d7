//! Clocks and time-window accounting
//!
//! The clock is injectable so tests can pin time. The sliding-window
//! limiter backs both rate-limit enforcement at execute time and the
//! `rate.*` predicate fields available to policy conditions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Default clock backed by the system time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock pinned to an explicit instant, advanced manually
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Create a clock pinned to `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock by `delta`
    pub fn advance(&self, delta: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += delta;
        }
    }

    /// Jump the clock to an explicit instant
    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Under the limit; the call was counted
    Allowed,
    /// Over the limit; retry after the given number of seconds
    Limited { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    /// Whether the call may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

#[derive(Debug)]
struct Window {
    count: u64,
    window_start: DateTime<Utc>,
}

/// Sliding-window call counter keyed by an arbitrary string
///
/// One limiter instance tracks many keys (typically `action_id` or
/// `agent_id`). Windows reset lazily on access.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl SlidingWindowLimiter {
    /// Create an empty limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a call against `key` and check it against `max_calls` per
    /// `window_seconds`
    pub fn check(
        &self,
        key: &str,
        max_calls: u64,
        window_seconds: u64,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(_) => return RateLimitDecision::Allowed,
        };

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            window_start: now,
        });

        let elapsed = (now - window.window_start).num_seconds().max(0) as u64;
        if elapsed >= window_seconds {
            window.count = 0;
            window.window_start = now;
        }

        if window.count >= max_calls {
            let remaining = window_seconds.saturating_sub(elapsed);
            return RateLimitDecision::Limited {
                retry_after_seconds: remaining.max(1),
            };
        }

        window.count += 1;
        RateLimitDecision::Allowed
    }

    /// Calls counted in the current window for `key`
    pub fn current_count(&self, key: &str) -> u64 {
        self.windows
            .lock()
            .ok()
            .and_then(|w| w.get(key).map(|s| s.count))
            .unwrap_or(0)
    }

    /// Drop all window state
    pub fn reset(&self) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.clear();
        }
    }
}
