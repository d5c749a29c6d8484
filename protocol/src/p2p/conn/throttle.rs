//! Byte-rate limiter shared by the send and receive routines.

use std::time::Duration;
use tokio::time::Instant;

/// Token bucket with a one-second burst.
///
/// `consume` never refuses: it records the bytes and sleeps long enough to
/// bring the average back under `rate`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    allowance: f64,
    last: Instant,
    total: u64,
    started: Instant,
}

impl RateLimiter {
    /// A `rate` of zero disables limiting.
    pub fn new(rate: u64) -> Self {
        let now = Instant::now();
        Self {
            rate,
            allowance: rate as f64,
            last: now,
            total: 0,
            started: now,
        }
    }

    /// Time to wait before `n` more bytes fit, updating the bucket.
    pub fn reserve(&mut self, n: usize) -> Duration {
        self.total += n as u64;
        if self.rate == 0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        let rate = self.rate as f64;
        self.allowance = (self.allowance + elapsed * rate).min(rate);
        self.allowance -= n as f64;
        if self.allowance >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.allowance / rate)
        }
    }

    pub async fn consume(&mut self, n: usize) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Bytes seen so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Average bytes per second since creation.
    pub fn average_rate(&self) -> u64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.total as f64 / secs) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_wait() {
        let mut limiter = RateLimiter::new(1000);
        assert_eq!(limiter.reserve(1000), Duration::ZERO);
        let wait = limiter.reserve(500);
        assert!(wait >= Duration::from_millis(499) && wait <= Duration::from_millis(501));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.reserve(100), Duration::ZERO);
        assert_eq!(limiter.total(), 1600);
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        let mut limiter = RateLimiter::new(0);
        assert_eq!(limiter.reserve(usize::MAX / 2), Duration::ZERO);
    }
}
