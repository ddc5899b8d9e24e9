//! # Dispatch Rate Limiter
//!
//! Paces item dispatch at `items.max_per_second`. Simple interval pacing:
//! each `acquire` waits until one interval after the previous grant, without
//! accumulating a burst allowance while idle.

use std::time::Duration;

use tokio::time::Instant;

/// Paces callers to at most `rate` acquisitions per second
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_at: Option<Instant>,
}

impl RateLimiter {
    /// Create a limiter granting `rate` permits per second. A rate of zero
    /// disables pacing entirely.
    pub fn per_second(rate: u32) -> Self {
        let interval = (rate > 0).then(|| Duration::from_secs_f64(1.0 / f64::from(rate)));
        Self {
            interval,
            next_at: None,
        }
    }

    /// Wait until the next permit is available.
    pub async fn acquire(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let now = Instant::now();
        match self.next_at {
            None => {
                self.next_at = Some(now + interval);
            }
            Some(next_at) => {
                if next_at > now {
                    tokio::time::sleep_until(next_at).await;
                }
                // Schedule from the grant time, not from now, so a slow
                // caller does not lower the effective rate further.
                self.next_at = Some(next_at.max(now) + interval);
            }
        }
    }
}
