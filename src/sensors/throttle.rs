use std::time::{Duration, Instant};

/// Coalesces updates that arrive faster than a chip's minimum interval.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_run: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_run: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn set_min_interval(&mut self, min_interval: Duration) {
        self.min_interval = min_interval;
    }

    /// Returns `true` and records `now` if enough time has passed since the
    /// last accepted call.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_run {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last_run = Some(now);
                true
            }
        }
    }

    /// Forget the last run so the next call always goes through.
    pub fn reset(&mut self) {
        self.last_run = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_always_runs() {
        let mut throttle = Throttle::new(Duration::from_secs(3));
        assert!(throttle.try_acquire(Instant::now()));
    }

    #[test]
    fn test_calls_within_interval_are_coalesced() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(3));
        assert!(throttle.try_acquire(t0));
        assert!(!throttle.try_acquire(t0 + Duration::from_millis(2999)));
        assert!(throttle.try_acquire(t0 + Duration::from_secs(3)));
        assert!(!throttle.try_acquire(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn test_reset_allows_immediate_run() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(5));
        assert!(throttle.try_acquire(t0));
        throttle.reset();
        assert!(throttle.try_acquire(t0));
    }

    #[test]
    fn test_interval_can_be_changed() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(5));
        throttle.set_min_interval(Duration::from_secs(1));
        assert_eq!(throttle.min_interval(), Duration::from_secs(1));
        assert!(throttle.try_acquire(t0));
        assert!(throttle.try_acquire(t0 + Duration::from_secs(1)));
    }
}
