use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Source of the network time.
///
/// The session reads the clock once at the beginning of every public
/// operation so that all timeout comparisons within the operation see the
/// same time.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// Wall clock time.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock driven explicitly via [`Self::advance`].
///
/// Clones share the same time. Optionally, every reading of the clock moves
/// it forward by a fixed step, which emulates passing time inside busy-wait
/// loops.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: Arc<AtomicU64>,
    step_nanos: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_step(Duration::ZERO)
    }

    /// Creates a clock which advances by `step` after each reading.
    pub fn with_step(step: Duration) -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
            step_nanos: step.as_nanos() as u64,
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.offset_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Time passed since the creation of the clock.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let nanos = self
            .offset_nanos
            .fetch_add(self.step_nanos, Ordering::AcqRel);
        self.base + Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        let shared = clock.clone();
        shared.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, Duration::from_millis(1500));
        assert_eq!(clock.elapsed(), Duration::from_millis(1500));

        let stepping = ManualClock::with_step(Duration::from_millis(10));
        let first = stepping.now();
        let second = stepping.now();
        assert_eq!(second - first, Duration::from_millis(10));
    }
}
