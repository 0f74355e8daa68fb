//! # Exponential Backoff
//!
//! Provides the capped exponential backoff used for requeues while a claim
//! waits for capacity or the store misbehaves.
//!
//! Sequence for `new(5s, 5m)`: 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).

use std::time::Duration;

/// Exponential backoff calculator
///
/// Doubles on every call to [`next_backoff`](Self::next_backoff), capped at
/// the configured maximum, and starts over after [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Minimum backoff (first value, and value after reset)
    min: Duration,
    /// Value returned by the next call
    current: Duration,
    /// Maximum backoff
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff between `min` and `max`
    ///
    /// A `max` below `min` is raised to `min`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            current: min,
            max,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
