use crate::common::*;
use std::time::{Duration, Instant};

/// Counts events and reports the rate once per interval.
#[derive(Debug)]
pub struct RateCounter {
    interval: Duration,
    count: f64,
    since: Instant,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            count: 0.0,
            since: Instant::now(),
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn add(&mut self, count: f64) {
        self.count += count;
    }

    /// Events per second since the last report, or `None` if the interval has not elapsed.
    pub fn rate(&mut self) -> Option<f64> {
        let elapsed = self.since.elapsed();
        if elapsed < self.interval {
            return None;
        }
        let rate = self.count / elapsed.as_secs_f64();
        self.count = 0.0;
        self.since = Instant::now();
        Some(rate)
    }
}

/// Whether `step` falls on a cadence of `every` steps.
pub fn on_cadence(step: usize, every: Option<NonZeroUsize>) -> bool {
    every
        .map(|every| step % every.get() == 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_test() {
        let mut counter = RateCounter::new(Duration::from_millis(0));
        counter.add(4.0);
        let rate = counter.rate();
        assert!(matches!(rate, Some(rate) if rate > 0.0));

        let mut counter = RateCounter::new(Duration::from_secs(3600));
        counter.add(1.0);
        assert!(counter.rate().is_none());
    }

    #[test]
    fn on_cadence_test() {
        assert!(on_cadence(10, NonZeroUsize::new(5)));
        assert!(!on_cadence(11, NonZeroUsize::new(5)));
        assert!(!on_cadence(10, None));
    }
}
