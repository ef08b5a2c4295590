use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::Ms;

/// Source of "now" for slot filtering and transaction dates.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: Ms) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_settable() {
        let clock = FixedClock::new(10);
        assert_eq!(clock.now_ms(), 10);
        clock.set(20);
        assert_eq!(clock.now_ms(), 20);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
