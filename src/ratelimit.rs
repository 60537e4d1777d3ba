//! Shared rate limiter for outbound calls to the remote importer.
//!
//! Enforces a minimum interval between successive calls across all upload
//! workers: a worker about to call sleeps for the remainder of the interval
//! since the previous call by any worker. Enforcement delays the caller —
//! calls are never rejected.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    /// Held across the sleep so exactly one waiter's delay calculation is
    /// honored at a time.
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Derive the interval from a requests-per-minute ceiling.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let interval = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / requests_per_minute as f64)
        };
        Self::new(interval)
    }

    /// Wait until a call is allowed, then reserve the slot.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let earliest = previous + self.min_interval;
            let now = Instant::now();
            if earliest > now {
                tokio::time::sleep_until(earliest).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}
