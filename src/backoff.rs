/// Exponential backoff with jitter for task retries.
///
/// The base delay doubles after each failed attempt, capped at
/// `max_delay`. Jitter spreads each delay uniformly over
/// `[delay * (1 - jitter), delay * (1 + jitter)]`, then the cap applies
/// again so no sleep ever exceeds `max_delay`.
use std::time::Duration;

use rand::Rng;

/// Longest delay allowed between attempts, wherever it was configured.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// How a task is retried. Resolved per task, falling back to the agent's
/// constraints and then to runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay, clamped to `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, 2).with_jitter(self.jitter)
    }
}

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    jitter: f64,
    current_delay: Duration,
    /// Number of delays handed out so far.
    attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            jitter: 0.0,
            current_delay: initial_delay.min(max_delay),
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Returns the next delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = self
            .current_delay
            .checked_mul(self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
