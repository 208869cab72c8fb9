// Rate throttle: at most one permit per window

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub struct Throttle {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    /// Take the permit if the window since the last grant has elapsed.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forget the last grant so the next call succeeds immediately.
    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}
