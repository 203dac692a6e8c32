//! Exponential-backoff retry policy for transient failures.
//!
//! The policy only computes delays and classifies attempts; the protected
//! call pipeline owns the loop so that every attempt re-enters the rate
//! limiter and circuit breaker.

use std::time::Duration;

use rand::Rng;

/// Marker for errors that are worth retrying.
pub trait Transient {
    /// True for network, timeout, connection and 5xx-class failures.
    fn is_transient(&self) -> bool;
}

/// Backoff schedule: `base * multiplier^(attempt-1)`, with up to 10% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after a failed `attempt` (1-based). Returns `None`
    /// once the attempt budget is spent.
    pub fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay = self.base.mul_f64(exp);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.9..1.1);
            delay = delay.mul_f64(factor);
        }
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = no_jitter(4);
        assert_eq!(policy.backoff_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff_delay(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.backoff_delay(4), None);
    }

    #[test]
    fn single_attempt_never_sleeps() {
        let policy = no_jitter(1);
        assert_eq!(policy.backoff_delay(1), None);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff_delay(1).unwrap();
            assert!(d >= Duration::from_millis(900));
            assert!(d <= Duration::from_millis(1100));
        }
    }
}
