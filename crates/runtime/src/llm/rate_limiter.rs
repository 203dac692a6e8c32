//! Token-bucket rate limiting per operation class.
//!
//! Acquisition is non-blocking: a call either takes a token and proceeds or
//! is rejected immediately. Rejected calls surface a typed `rate_limited`
//! error and never reach the network.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// A single token bucket. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket with `capacity` burst tokens refilled at
    /// `refill_rate` tokens per second.
    pub fn new(refill_rate: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity).max(1.0);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token level, refreshed to `now`.
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

/// Named token buckets, one per operation class.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the bucket for an operation class.
    pub fn configure(&self, operation: &str, refill_rate: f64, burst: u32) {
        self.buckets
            .lock()
            .insert(operation.to_string(), TokenBucket::new(refill_rate, burst));
    }

    /// Non-blocking acquire. Operations without a configured bucket are
    /// admitted; rate limiting is opt-in per class.
    pub fn try_acquire(&self, operation: &str) -> bool {
        match self.buckets.lock().get_mut(operation) {
            Some(bucket) => bucket.try_acquire(),
            None => true,
        }
    }

    /// Remaining tokens per configured operation, for introspection.
    pub fn levels(&self) -> HashMap<String, f64> {
        let mut buckets = self.buckets.lock();
        buckets
            .iter_mut()
            .map(|(name, bucket)| (name.clone(), bucket.available()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_reject() {
        // rate=2/s, burst=2: four rapid calls -> accept, accept, reject, reject.
        let mut bucket = TokenBucket::new(2.0, 2);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0 + Duration::from_millis(30)));
        assert!(!bucket.try_acquire_at(t0 + Duration::from_millis(60)));
        assert!(!bucket.try_acquire_at(t0 + Duration::from_millis(90)));
        // After a second the bucket has refilled enough for one more.
        assert!(bucket.try_acquire_at(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let mut bucket = TokenBucket::new(100.0, 5);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0));
        // A long idle period must not overfill.
        bucket.refill(t0 + Duration::from_secs(3600));
        assert!(bucket.tokens <= 5.0);
    }

    #[test]
    fn accepted_calls_bounded_by_capacity_plus_rate() {
        // Property: over a window W, accepted <= capacity + rate * W.
        let mut bucket = TokenBucket::new(10.0, 5);
        let t0 = Instant::now();
        let window = Duration::from_secs(2);
        let mut accepted = 0;
        for i in 0..1000 {
            let now = t0 + window.mul_f64(i as f64 / 1000.0);
            if bucket.try_acquire_at(now) {
                accepted += 1;
            }
        }
        assert!(accepted as f64 <= 5.0 + 10.0 * 2.0 + 1.0, "accepted={accepted}");
    }

    #[test]
    fn zero_rate_bucket_only_bursts() {
        let mut bucket = TokenBucket::new(0.0, 2);
        let t0 = Instant::now();
        assert!(bucket.try_acquire_at(t0));
        assert!(bucket.try_acquire_at(t0));
        assert!(!bucket.try_acquire_at(t0 + Duration::from_secs(600)));
    }

    #[test]
    fn limiter_routes_by_operation() {
        let limiter = RateLimiter::new();
        limiter.configure("chat", 1.0, 1);
        limiter.configure("embed", 1.0, 2);

        assert!(limiter.try_acquire("chat"));
        assert!(!limiter.try_acquire("chat"));
        // Separate bucket.
        assert!(limiter.try_acquire("embed"));
        assert!(limiter.try_acquire("embed"));
        assert!(!limiter.try_acquire("embed"));
    }

    #[test]
    fn unconfigured_operation_is_admitted() {
        let limiter = RateLimiter::new();
        assert!(limiter.try_acquire("unconfigured"));
    }

    #[test]
    fn levels_report_remaining() {
        let limiter = RateLimiter::new();
        limiter.configure("chat", 5.0, 10);
        limiter.try_acquire("chat");
        let levels = limiter.levels();
        assert!(levels["chat"] <= 10.0);
        assert!(levels["chat"] >= 8.9);
    }
}
