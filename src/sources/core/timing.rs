//! Human-like pacing for interactive sources.
//!
//! Keystroke gaps and inter-attempt pauses are jittered around a base value
//! and stretched after consecutive failures.

use std::cmp::Ordering;
use std::time::Duration;

use rand::Rng;

/// Outcome reported back after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFeedback {
    Success,
    Failure,
    NotReady,
}

/// Jittered delay generator.
#[derive(Debug, Clone)]
pub struct Pacing {
    base: Duration,
    min: Duration,
    max: Duration,
    variance_pct: f64,
    recent_failures: u32,
}

impl Pacing {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            min: base / 2,
            max: base * 2,
            variance_pct: 0.25,
            recent_failures: 0,
        }
    }

    pub fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min = min;
        self.max = max.max(min);
        self
    }

    pub fn with_variance(mut self, variance_pct: f64) -> Self {
        self.variance_pct = variance_pct.clamp(0.0, 1.0);
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn register(&mut self, feedback: AttemptFeedback) {
        match feedback {
            AttemptFeedback::Success => {
                self.recent_failures = 0;
            }
            AttemptFeedback::Failure => {
                self.recent_failures = self.recent_failures.saturating_add(2);
            }
            AttemptFeedback::NotReady => {
                self.recent_failures = self.recent_failures.saturating_add(1);
            }
        }
    }

    pub fn next_delay(&self) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }

        let mut delay = self.base.as_secs_f64();
        match self.recent_failures.cmp(&2) {
            Ordering::Less => {}
            Ordering::Equal => delay *= 1.5,
            Ordering::Greater => delay *= 2.0,
        }

        let spread = delay * self.variance_pct;
        if spread > 0.0 {
            delay += rand::thread_rng().gen_range(-spread / 2.0..=spread / 2.0);
        }
        let clamped = delay.clamp(self.min.as_secs_f64(), self.max.as_secs_f64());
        Duration::from_secs_f64(clamped.max(0.0))
    }
}
