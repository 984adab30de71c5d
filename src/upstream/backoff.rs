//! Retry pacing for upstream operations
//!
//! Two small tools: a bounded exponential backoff used by the stream
//! engine's self-heal loop, and a throttle keeping interactive progress
//! edits at least a second apart so the upstream rate limiter stays calm.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Self-heal retry budget
pub const SELF_HEAL_ATTEMPTS: u32 = 3;

/// Bounded exponential backoff.
pub struct Backoff {
    base: Duration,
    factor: u32,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: u32, max_attempts: u32) -> Self {
        Backoff {
            base,
            factor,
            max_attempts,
            attempt: 0,
        }
    }

    /// The stream engine's schedule: 100 ms, 400 ms, 1.6 s.
    pub fn self_heal() -> Self {
        Backoff::new(Duration::from_millis(100), 4, SELF_HEAL_ATTEMPTS)
    }

    /// Get the next delay, or None once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let delay = self.base * self.factor.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn attempts_used(&self) -> u32 {
        self.attempt
    }

    /// Reset after a fully successful stretch.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Minimum-interval gate for message edits.
pub struct EditThrottle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl EditThrottle {
    pub fn new(min_interval: Duration) -> Self {
        EditThrottle {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// True when enough time has passed since the last permitted edit.
    /// A denied call does not move the window.
    pub fn permit(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl Default for EditThrottle {
    fn default() -> Self {
        EditThrottle::new(Duration::from_secs(1))
    }
}
