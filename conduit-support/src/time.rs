use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

/// Exponentially-weighted moving average used to smooth round-trip time
/// samples: `new = 0.25 * sample + 0.75 * old`, with the first sample
/// replacing the estimate outright.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    smoothed: Option<Duration>,
}

impl RttEstimator {
    pub const fn new() -> Self {
        RttEstimator { smoothed: None }
    }

    /// Folds a fresh RTT sample into the estimate and returns the updated
    /// smoothed value.
    pub fn sample(&mut self, sample: Duration) -> Duration {
        let updated = match self.smoothed {
            None => sample,
            Some(old) => {
                let sample_ns = sample.as_nanos() as f64;
                let old_ns = old.as_nanos() as f64;
                Duration::from_nanos((0.25 * sample_ns + 0.75 * old_ns) as u64)
            }
        };

        self.smoothed = Some(updated);
        updated
    }

    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(Duration::from_millis(100))
    }

    /// `max(0.1, 2 * RTT + 0.01)` seconds, per the resend-delay formula.
    pub fn resend_delay(&self) -> Duration {
        let rtt = self.get();
        let candidate = rtt.saturating_mul(2) + Duration::from_millis(10);
        candidate.max(Duration::from_millis(100))
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// A monotonic clock handle threaded through the pump so every timer
/// comparison uses a single consistent `now` per tick instead of calling
/// `Instant::now()` repeatedly (and observing torn time across a tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clock(Instant);

impl Clock {
    pub fn now() -> Self {
        Clock(Instant::now())
    }

    pub fn inner(self) -> Instant {
        self.0
    }

    pub fn elapsed_since(self, earlier: Clock) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn advance(self, by: Duration) -> Self {
        Clock(self.0 + by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_first_sample_replaces_estimate() {
        let mut rtt = RttEstimator::new();
        let sampled = rtt.sample(Duration::from_millis(40));
        assert_eq!(sampled, Duration::from_millis(40));
    }

    #[test]
    fn rtt_smooths_subsequent_samples() {
        let mut rtt = RttEstimator::new();
        rtt.sample(Duration::from_millis(100));
        let next = rtt.sample(Duration::from_millis(20));
        // 0.25*20 + 0.75*100 = 80
        assert_eq!(next, Duration::from_millis(80));
    }

    #[test]
    fn resend_delay_never_below_floor() {
        let rtt = RttEstimator::new();
        assert_eq!(rtt.resend_delay(), Duration::from_millis(100));
    }
}
