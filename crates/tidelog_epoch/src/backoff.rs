//! Adaptive backoff scalar.
//!
//! A clamped value that grows multiplicatively under negative feedback and
//! decays linearly with elapsed time under positive feedback. The health
//! monitor uses one as its state timer: the node reads as unhealthy while
//! the value sits above the loop period.

use std::time::{Duration, Instant};

use rand::Rng;

pub struct AdaptiveBackoff {
    min_ms: f64,
    max_ms: f64,
    multiplier: f64,
    /// Decay in milliseconds per elapsed millisecond of positive feedback.
    decrease_rate: f64,
    /// Fractional jitter applied to each growth step.
    fuzz_factor: f64,
    current_ms: f64,
    last_positive: Option<Instant>,
}

impl AdaptiveBackoff {
    pub fn new(
        min: Duration,
        initial: Duration,
        max: Duration,
        multiplier: f64,
        decrease_rate: f64,
        fuzz_factor: f64,
    ) -> Self {
        let min_ms = min.as_secs_f64() * 1e3;
        let max_ms = max.as_secs_f64() * 1e3;
        let initial_ms = (initial.as_secs_f64() * 1e3).clamp(min_ms, max_ms);
        Self {
            min_ms,
            max_ms,
            multiplier,
            decrease_rate,
            fuzz_factor,
            current_ms: initial_ms,
            last_positive: None,
        }
    }

    pub fn current(&self) -> Duration {
        Duration::from_secs_f64(self.current_ms / 1e3)
    }

    /// Grow the value by the multiplier, fuzzed.
    pub fn negative_feedback(&mut self) {
        let fuzz = if self.fuzz_factor > 0.0 {
            rand::thread_rng().gen_range(-self.fuzz_factor..=self.fuzz_factor)
        } else {
            0.0
        };
        let grown = self.current_ms * self.multiplier * (1.0 + fuzz);
        self.current_ms = grown.clamp(self.min_ms, self.max_ms);
    }

    /// Decay the value in proportion to the time elapsed since the previous
    /// positive feedback.
    pub fn positive_feedback(&mut self, now: Instant) {
        let elapsed_ms = match self.last_positive {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f64() * 1e3,
            None => 0.0,
        };
        self.last_positive = Some(now);
        let decayed = self.current_ms - elapsed_ms * self.decrease_rate;
        self.current_ms = decayed.clamp(self.min_ms, self.max_ms);
    }
}
