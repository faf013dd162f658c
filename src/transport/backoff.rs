//! Reconnect backoff.
//!
//! [`BackoffPolicy`] is a pure mapping from attempt number to delay:
//! `min(base * 2^attempt, max)`, which with the defaults yields
//! 2s, 4s, 8s, 16s, 30s, 30s, ... [`BackoffState`] is the per-session counter
//! the connection manager advances on every failed attempt.

use std::time::Duration;

use rand::Rng;

use crate::core::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, MAX_BACKOFF_JITTER, MAX_BACKOFF_SHIFT,
};

/// Exponential backoff capped at a maximum delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0 (never zero).
    base: Duration,
    /// Upper bound for un-jittered delays.
    max: Duration,
    /// Symmetric jitter fraction in `0.0..=0.1`.
    jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    ///
    /// A zero `base` is raised to 1ms and `max` is raised to `base`, so the
    /// policy never yields a zero delay.
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            jitter: 0.0,
        }
    }

    /// Enable jitter; the fraction is clamped to `0.0..=0.1`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, MAX_BACKOFF_JITTER)
        } else {
            0.0
        };
        self
    }

    /// Delay for attempt 0.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Cap for un-jittered delays.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Configured jitter fraction.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
        self.base.saturating_mul(multiplier).min(self.max)
    }

    /// [`delay`](Self::delay) with jitter applied.
    ///
    /// The result stays within `[base, max * 1.1]`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter == 0.0 {
            return delay;
        }

        let delay_ms = delay.as_secs_f64() * 1000.0;
        let spread = delay_ms * self.jitter;
        let jittered = delay_ms + rng.gen_range(-spread..=spread);

        let floor = self.base.as_secs_f64() * 1000.0;
        let ceiling = self.max.as_secs_f64() * 1000.0 * (1.0 + MAX_BACKOFF_JITTER);
        Duration::from_secs_f64(jittered.clamp(floor, ceiling) / 1000.0)
    }
}

/// Consecutive-failure counter of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Failed attempts since the last successful connection.
    pub attempt: u32,
    /// Delay scheduled after the most recent failure.
    pub next_delay: Duration,
}

impl BackoffState {
    /// Record a failed attempt and return the delay before the next one.
    pub fn fail(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = policy.jittered_delay(self.attempt, &mut rand::thread_rng());
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay = delay;
        delay
    }

    /// Reset after a transport reached a connected state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
