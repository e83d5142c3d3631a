//! Simulated monotonic clock

use core::sync::atomic::{AtomicU64, Ordering};

use akern_api::Nanoseconds;

/// Nanosecond clock that only moves when told to
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    /// Creates a clock at zero
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Current time
    pub fn now(&self) -> Nanoseconds {
        self.now.load(Ordering::Acquire)
    }

    /// Moves the clock forward, returning the new time
    pub fn advance(&self, ns: Nanoseconds) -> Nanoseconds {
        let prev = self
            .now
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_add(ns)))
            .unwrap_or_else(|t| t);
        prev.saturating_add(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_saturates() {
        let clock = SimClock::new();
        assert_eq!(clock.advance(10), 10);
        assert_eq!(clock.advance(u64::MAX), u64::MAX);
        assert_eq!(clock.now(), u64::MAX);
    }
}
