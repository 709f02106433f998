//! Token-bucket rate shaping, shared by all workers of one download.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    /// May go negative: a large write borrows tokens and the caller sleeps
    /// off the debt, which keeps the long-run rate at the configured limit.
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket parameterised by bytes per second, with a burst of at most
/// one second worth of tokens. A rate of `0` disables limiting entirely.
pub struct SpeedLimiter {
    rate: f64,
    capacity: f64,
    bucket: Option<Mutex<Bucket>>,
}

impl SpeedLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        let rate = bytes_per_sec as f64;
        Self {
            rate,
            capacity: rate,
            bucket: Some(Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            rate: 0.0,
            capacity: 0.0,
            bucket: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Waits until `n` bytes worth of tokens are available, then consumes
    /// them. No-op when the limiter is disabled.
    pub async fn acquire(&self, n: u64) {
        let Some(bucket) = &self.bucket else { return };

        let wait = {
            let mut b = bucket.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(b.last_refill).as_secs_f64();
            b.tokens = (b.tokens + elapsed * self.rate).min(self.capacity);
            b.last_refill = now;
            b.tokens -= n as f64;
            if b.tokens < 0.0 {
                Duration::from_secs_f64(-b.tokens / self.rate)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
