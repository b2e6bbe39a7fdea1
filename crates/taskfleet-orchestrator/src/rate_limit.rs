use std::collections::HashMap;
use std::time::{Duration, Instant};
use taskfleet_core::LinkMode;
use tokio::sync::Mutex;
use uuid::Uuid;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter for cross-team interactions, keyed by the
/// acting pair and interaction mode.
///
/// The bucket holds a full hour's budget as its burst size and refills
/// continuously at `per_hour / 3600` tokens per second.
pub struct PairRateLimiter {
    max_tokens: f64,
    refill_per_second: f64,
    buckets: Mutex<HashMap<(Uuid, Uuid, LinkMode), Bucket>>,
}

impl PairRateLimiter {
    pub fn new(per_hour: u32) -> Self {
        let max_tokens = f64::from(per_hour.max(1));
        Self {
            max_tokens,
            refill_per_second: max_tokens / 3600.0,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume one token for the given pair and mode.
    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, from: Uuid, to: Uuid, mode: LinkMode) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();

        let bucket = buckets.entry((from, to, mode)).or_insert(Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets with no activity for the given duration.
    pub async fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_up_to_budget() {
        let limiter = PairRateLimiter::new(10);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for _ in 0..10 {
            assert!(limiter.check(a, b, LinkMode::Crosstalk).await);
        }
        assert!(!limiter.check(a, b, LinkMode::Crosstalk).await);
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let limiter = PairRateLimiter::new(1);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(limiter.check(a, b, LinkMode::Crosstalk).await);
        assert!(!limiter.check(a, b, LinkMode::Crosstalk).await);
        // A different peer and the reverse direction have their own buckets.
        assert!(limiter.check(a, c, LinkMode::Crosstalk).await);
        assert!(limiter.check(b, a, LinkMode::Crosstalk).await);
    }

    #[tokio::test]
    async fn test_modes_are_independent() {
        let limiter = PairRateLimiter::new(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(limiter.check(a, b, LinkMode::Crosstalk).await);
        assert!(limiter.check(a, b, LinkMode::Handoff).await);
        assert!(!limiter.check(a, b, LinkMode::Handoff).await);
    }
}
