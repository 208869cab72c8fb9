// Retry backoff — exponential delay with an optional multiplicative jitter band

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`,
/// then scaled by a random factor drawn from the jitter band.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    /// Delay for attempt 0
    pub initial: Duration,
    /// Upper bound applied before jitter
    pub max: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// `[low, high)` scale factors; `None` disables jitter
    pub jitter: Option<(f64, f64)>,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Some((0.5, 1.5)),
        }
    }
}

impl RetryBackoff {
    /// Doubling backoff without jitter.
    pub fn doubling(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: None,
        }
    }

    /// Same schedule with a different cap.
    pub fn with_max(&self, max: Duration) -> Self {
        Self {
            max,
            ..self.clone()
        }
    }

    /// Capped delay for `attempt`, before jitter. Non-decreasing in
    /// `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max;
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay to wait before `attempt`, with jitter applied after the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self.jitter {
            Some((low, high)) if high > low => {
                let factor = rand::thread_rng().gen_range(low..high);
                base.mul_f64(factor)
            }
            _ => base,
        }
    }
}
