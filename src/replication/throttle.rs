//! Outbound byte-rate limiting for segment file transfers.
//!
//! A token bucket holding at most one second worth of bytes. A reservation
//! larger than the balance drives the bucket into debt, and the caller sleeps
//! until the debt would be repaid. Concurrent reservations queue behind each
//! other's debt, so the aggregate rate across all chunk tasks stays bounded.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct Bucket {
    balance: f64,
    last_refill: Instant,
}

/// Byte-rate limiter shared by every transfer of a coordinator.
pub struct RateLimiter {
    bytes_per_second: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_second`, or `None` when the rate is zero.
    pub fn new(bytes_per_second: u64) -> Option<Self> {
        if bytes_per_second == 0 {
            return None;
        }
        Some(Self {
            bytes_per_second: AtomicU64::new(bytes_per_second),
            bucket: Mutex::new(Bucket {
                balance: bytes_per_second as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Wait until `bytes` may be sent. Returns how long the caller was held back.
    pub async fn pause(&self, bytes: u64) -> Duration {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Take `bytes` from the bucket and compute the required delay.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let rate = self.bytes_per_second.load(Ordering::Relaxed) as f64;
        let mut bucket = self.bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.balance = (bucket.balance + rate * elapsed).min(rate);
        bucket.last_refill = now;

        bucket.balance -= bytes as f64;
        if bucket.balance >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.balance / rate)
        }
    }

    /// Change the rate. Takes effect for the next reservation.
    pub fn set_rate(&self, bytes_per_second: u64) {
        let rate = bytes_per_second.max(1);
        let previous = self.bytes_per_second.swap(rate, Ordering::Relaxed);
        debug!(previous, rate, "Updated transfer rate limit");
    }

    /// Current rate in bytes per second.
    pub fn current_rate(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("bytes_per_second", &self.current_rate())
            .field("balance", &self.bucket.lock().balance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_disables_limiter() {
        assert!(RateLimiter::new(0).is_none());
    }

    #[test]
    fn test_burst_within_bucket_is_free() {
        let limiter = RateLimiter::new(1000).unwrap();
        assert_eq!(limiter.reserve(400), Duration::ZERO);
        assert_eq!(limiter.reserve(500), Duration::ZERO);
    }

    #[test]
    fn test_debt_requires_wait() {
        let limiter = RateLimiter::new(1000).unwrap();
        limiter.reserve(1000);
        let wait = limiter.reserve(500);
        assert!(wait >= Duration::from_millis(400), "waited {:?}", wait);
        assert!(wait <= Duration::from_millis(500), "waited {:?}", wait);
    }

    #[test]
    fn test_set_rate() {
        let limiter = RateLimiter::new(1000).unwrap();
        limiter.set_rate(5000);
        assert_eq!(limiter.current_rate(), 5000);
        limiter.set_rate(0);
        assert_eq!(limiter.current_rate(), 1);
    }

    #[tokio::test]
    async fn test_pause_reports_throttle_time() {
        let limiter = RateLimiter::new(10_000).unwrap();
        assert_eq!(limiter.pause(10_000).await, Duration::ZERO);
        let start = Instant::now();
        let waited = limiter.pause(500).await;
        assert!(waited > Duration::ZERO);
        assert!(start.elapsed() >= waited);
    }
}
