//! Retry policy: decides backoff delays.
//!
//! タスクのリトライ（republish の遅延）と broker 再接続の両方で使う。

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,

    /// 有効なら各 delay を [delay/2, delay] の範囲でランダム化する
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `attempt` (1-indexed; 0 is treated as 1).
    ///
    /// Example with base_delay=1s, multiplier=2.0, no jitter:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
        } else {
            self.max_delay
        };
        if self.jitter {
            capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            capped
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zeroth_is_base(0, 1)]
    #[case::first(1, 1)]
    #[case::second(2, 2)]
    #[case::third(3, 4)]
    #[case::capped(10, 60)]
    #[case::huge_attempt(u32::MAX, 60)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(800), 2.0, Duration::from_secs(10))
            .with_jitter();

        for _ in 0..100 {
            let delay = policy.next_delay(2);
            assert!(delay >= Duration::from_millis(799));
            assert!(delay <= Duration::from_millis(1600));
        }
    }
}
