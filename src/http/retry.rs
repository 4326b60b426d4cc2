//! Retry policy: per failed attempt, stop or wait and try again.

use log::debug;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::TransportError;

/// What happened on a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The transport failed before a response arrived.
    Transport { retryable: bool },
    Timeout,
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
    },
}

impl Outcome {
    pub fn from_transport_error(error: &TransportError) -> Self {
        match error {
            TransportError::Timeout(_) => Outcome::Timeout,
            TransportError::Connect(_) | TransportError::ContextTornDown(_) => {
                Outcome::Transport { retryable: true }
            }
            TransportError::Other(_) => Outcome::Transport { retryable: false },
        }
    }

    pub fn from_status(status: StatusCode, headers: &HeaderMap) -> Self {
        Outcome::Status {
            status,
            retry_after: parse_retry_after(headers),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Stop,
    RetryAfter(Duration),
}

/// Exponential backoff with jitter, bounded by an attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    ceiling: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, ceiling: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            ceiling: ceiling.max(base),
            jitter: true,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.backoff_base(),
            config.backoff_ceiling(),
        )
    }

    /// Disables jitter; delays become exactly the computed backoff.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `base * 2^(attempt-1)`, capped at the ceiling. Attempts are 1-indexed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Uniform jitter in `[0, delay / 2)`.
    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay.saturating_add(delay.mul_f64(fastrand::f64() * 0.5))
    }

    pub fn should_retry(&self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        if attempt >= self.max_attempts {
            debug!("attempt {}/{}: budget exhausted", attempt, self.max_attempts);
            return RetryDecision::Stop;
        }

        match outcome {
            Outcome::Transport { retryable: false } => RetryDecision::Stop,
            Outcome::Transport { retryable: true } | Outcome::Timeout => {
                RetryDecision::RetryAfter(self.jittered(self.backoff(attempt)))
            }
            Outcome::Status {
                status,
                retry_after,
            } => {
                if *status == StatusCode::TOO_MANY_REQUESTS {
                    match retry_after {
                        Some(delay) => RetryDecision::RetryAfter(*delay),
                        None => RetryDecision::RetryAfter(self.jittered(self.backoff(attempt))),
                    }
                } else if status.is_server_error() {
                    RetryDecision::RetryAfter(self.jittered(self.backoff(attempt)))
                } else {
                    // 401 is handled by re-authentication; other 4xx are terminal.
                    RetryDecision::Stop
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_ATTEMPTS,
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
    }
}

/// Longest server-requested wait that is honored.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Reads a delta-seconds `Retry-After` header, clamped to
/// [`MAX_RETRY_AFTER`]. HTTP-date values are not honored and fall back to
/// computed backoff.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let seconds: f64 = value.parse().ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    let delay = Duration::try_from_secs_f64(seconds).unwrap_or(MAX_RETRY_AFTER);
    Some(delay.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(10))
            .without_jitter()
    }

    fn status(code: u16) -> Outcome {
        Outcome::Status {
            status: StatusCode::from_u16(code).unwrap(),
            retry_after: None,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = policy(10);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(64), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(10));
        for _ in 0..100 {
            match policy.should_retry(1, &status(503)) {
                RetryDecision::RetryAfter(delay) => {
                    assert!(delay >= Duration::from_secs(2));
                    assert!(delay < Duration::from_secs(3));
                }
                RetryDecision::Stop => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn test_stops_when_budget_exhausted() {
        let policy = policy(3);
        assert!(matches!(policy.should_retry(1, &status(503)), RetryDecision::RetryAfter(_)));
        assert!(matches!(policy.should_retry(2, &status(503)), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.should_retry(3, &status(503)), RetryDecision::Stop);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert_eq!(policy(1).should_retry(1, &Outcome::Timeout), RetryDecision::Stop);
    }

    #[test]
    fn test_server_errors_and_connection_failures_are_retryable() {
        let policy = policy(3);
        for code in [500, 502, 503, 504] {
            assert_eq!(
                policy.should_retry(1, &status(code)),
                RetryDecision::RetryAfter(Duration::from_secs(1))
            );
        }
        assert_eq!(
            policy.should_retry(2, &Outcome::Transport { retryable: true }),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.should_retry(1, &Outcome::Timeout),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.should_retry(1, &Outcome::Transport { retryable: false }),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_client_errors_are_terminal() {
        let policy = policy(3);
        for code in [400, 401, 403, 404, 422] {
            assert_eq!(policy.should_retry(1, &status(code)), RetryDecision::Stop);
        }
    }

    #[test]
    fn test_rate_limit_honors_retry_after() {
        let policy = policy(3);
        let outcome = Outcome::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(
            policy.should_retry(1, &outcome),
            RetryDecision::RetryAfter(Duration::from_secs(30))
        );
        assert_eq!(
            policy.should_retry(1, &status(429)),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("-5"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_clamps_huge_values() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e300"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("inf"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("86400"));
        assert_eq!(parse_retry_after(&headers), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_outcome_from_transport_error() {
        assert_eq!(
            Outcome::from_transport_error(&TransportError::Timeout("t".into())),
            Outcome::Timeout
        );
        assert_eq!(
            Outcome::from_transport_error(&TransportError::Connect("c".into())),
            Outcome::Transport { retryable: true }
        );
        assert_eq!(
            Outcome::from_transport_error(&TransportError::Other("o".into())),
            Outcome::Transport { retryable: false }
        );
    }
}
