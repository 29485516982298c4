//! Retry, backoff and timeout policy applied to a single submission.

use std::time::Duration;

/// Upper bound for a single backoff delay before jitter.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Effective policy for one job submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPolicy {
    /// Per-attempt time limit. `None` means unlimited.
    pub timeout: Option<Duration>,
    /// Attempts allowed after the first one.
    pub retries: u32,
    /// Base delay before the first retry.
    pub retry_backoff: Duration,
    /// Fraction in `[0, 1]` randomizing each delay by `±jitter`.
    pub retry_jitter: f64,
    /// Wall-clock cap on the retry window, measured from the first attempt.
    pub retry_deadline: Option<Duration>,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 0,
            retry_backoff: Duration::from_millis(750),
            retry_jitter: 0.3,
            retry_deadline: None,
        }
    }
}

impl JobPolicy {
    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.retry_deadline = Some(deadline);
        self
    }

    /// Whether another attempt may follow the failed attempt `attempt`
    /// (1-based) given the time elapsed since the first attempt started.
    pub fn should_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        if attempt >= self.max_attempts() {
            return false;
        }
        match self.retry_deadline {
            Some(deadline) => elapsed < deadline,
            None => true,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based):
    /// `base * 2^(retry-1)`, capped at [`MAX_BACKOFF`].
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let secs = self.retry_backoff.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
    }

    /// Jittered delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_secs_f64();
        let jitter = if self.retry_jitter.is_nan() {
            0.0
        } else {
            self.retry_jitter.clamp(0.0, 1.0)
        };
        if jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = 1.0 + jitter * (2.0 * rand::random::<f64>() - 1.0);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = JobPolicy::default();
        assert_eq!(policy.max_attempts(), 1);
        assert!(policy.timeout.is_none());
        assert!(!policy.should_retry(1, Duration::ZERO));
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = JobPolicy::default().with_retries(2, Duration::from_millis(10));
        assert!(policy.should_retry(1, Duration::ZERO));
        assert!(policy.should_retry(2, Duration::ZERO));
        assert!(!policy.should_retry(3, Duration::ZERO));
    }

    #[test]
    fn test_should_retry_respects_deadline() {
        let policy = JobPolicy::default()
            .with_retries(10, Duration::from_millis(10))
            .with_deadline(Duration::from_secs(5));
        assert!(policy.should_retry(1, Duration::from_secs(4)));
        assert!(!policy.should_retry(1, Duration::from_secs(5)));
    }

    #[test]
    fn test_exponential_delay_without_jitter() {
        let policy = JobPolicy::default()
            .with_retries(8, Duration::from_secs(1))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(8), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = JobPolicy::default()
            .with_retries(3, Duration::from_secs(2))
            .with_jitter(0.25);
        for _ in 0..200 {
            let delay = policy.delay_for_retry(1).as_secs_f64();
            assert!((1.5..=2.5).contains(&delay), "delay {delay} out of band");
        }
    }
}
