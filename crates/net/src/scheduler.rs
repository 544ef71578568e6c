use std::{collections::VecDeque, time::Instant};

/// Time ordered list of deferred procedures.
///
/// Procedures scheduled for the same time are kept in the order of
/// scheduling.
pub(crate) struct Scheduler<T> {
    queue: VecDeque<Scheduled<T>>,
}

struct Scheduled<T> {
    time: Instant,
    procedure: T,
}

impl<T> Scheduler<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn schedule(&mut self, time: Instant, procedure: T) {
        let position = self
            .queue
            .iter()
            .position(|scheduled| scheduled.time > time)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, Scheduled { time, procedure });
    }

    /// Removes and returns all procedures due at `now` in the order they
    /// should be run.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<T> {
        let due = self
            .queue
            .iter()
            .position(|scheduled| scheduled.time > now)
            .unwrap_or(self.queue.len());
        self.queue
            .drain(..due)
            .map(|scheduled| scheduled.procedure)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_ordering() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.schedule(start + Duration::from_millis(300), "c");
        scheduler.schedule(start + Duration::from_millis(100), "a");
        scheduler.schedule(start + Duration::from_millis(300), "d");
        scheduler.schedule(start + Duration::from_millis(200), "b");
        assert_eq!(scheduler.len(), 4);

        assert!(scheduler.take_due(start).is_empty());
        assert_eq!(
            scheduler.take_due(start + Duration::from_millis(200)),
            vec!["a", "b"]
        );

        // Scheduled while the previous pass is being processed.
        scheduler.schedule(start + Duration::from_millis(200), "e");
        assert_eq!(
            scheduler.take_due(start + Duration::from_millis(500)),
            vec!["e", "c", "d"]
        );
        assert_eq!(scheduler.len(), 0);
    }
}
