//! Classification of worker-level failures and the exponential-backoff
//! policy applied to the transient ones.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// High-level classification of a failed range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request or response body read timed out.
    Timeout,
    /// Connection-level failure (refused, reset, aborted mid-stream).
    Connection,
    /// Server asked us to slow down (429) or timed the request out (408).
    Throttled,
    /// Retryable server-side status.
    Http5xx(u16),
    /// Anything else; never retried.
    Fatal,
}

/// Decision returned by [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with a delay cap and a small jitter so parallel
/// workers that fail together do not retry in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            base_delay: Duration::from_millis(base_delay_ms.max(1)),
            ..Self::default()
        }
    }

    /// `attempt` is 1-based (1 = first attempt).
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            ErrorKind::Fatal => RetryDecision::NoRetry,
            ErrorKind::Timeout
            | ErrorKind::Connection
            | ErrorKind::Throttled
            | ErrorKind::Http5xx(_) => {
                let exp = 1u32 << attempt.saturating_sub(1).min(8);
                let raw = self.base_delay.saturating_mul(exp);
                RetryDecision::RetryAfter(jitter(raw.min(self.max_delay)))
            }
        }
    }
}

/// Adds up to 25% of random-ish jitter on top of `delay`.
fn jitter(delay: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let quarter = delay.as_millis() as u64 / 4;
    if quarter == 0 {
        return delay;
    }
    delay + Duration::from_millis(nanos % quarter)
}

/// Classify a transport-level `reqwest` error.
pub fn classify_reqwest(err: &reqwest::Error) -> ErrorKind {
    if err.is_redirect() {
        // Redirect loop or refused downgrade; retrying cannot help.
        return ErrorKind::Fatal;
    }
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        return ErrorKind::Connection;
    }
    ErrorKind::Fatal
}

/// Classify an HTTP status code received in place of the expected 206/200.
pub fn classify_status(code: u16) -> ErrorKind {
    match code {
        408 | 429 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_is_never_retried() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Fatal), RetryDecision::NoRetry);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut p = RetryPolicy::default();
        p.max_attempts = 20;
        let d1 = match p.decide(1, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        let d4 = match p.decide(4, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        assert!(d4 >= d1);

        let d_last = match p.decide(15, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            _ => panic!("expected retry"),
        };
        // Jitter adds at most 25% on top of the cap.
        assert!(d_last <= p.max_delay + p.max_delay / 4);
    }

    #[test]
    fn respects_max_attempts() {
        let p = RetryPolicy::new(3, 100);
        assert!(matches!(
            p.decide(2, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429), ErrorKind::Throttled);
        assert_eq!(classify_status(408), ErrorKind::Throttled);
        assert!(matches!(classify_status(502), ErrorKind::Http5xx(502)));
        assert_eq!(classify_status(404), ErrorKind::Fatal);
        assert_eq!(classify_status(416), ErrorKind::Fatal);
    }
}
