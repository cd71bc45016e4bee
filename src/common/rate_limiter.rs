//! Request pacing
//!
//! Spreads requests evenly so that at most `requests_per_second` leave the
//! process per second. Callers that arrive early wait for their slot.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn per_second(requests_per_second: usize) -> Self {
        let rps = requests_per_second.max(1) as u32;
        Self {
            spacing: Duration::from_secs(1) / rps,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Waits until this caller's slot opens
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.spacing;
            slot
        };
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spacing_from_rate() {
        assert_eq!(RateLimiter::per_second(10).spacing(), Duration::from_millis(100));
        assert_eq!(RateLimiter::per_second(0).spacing(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requests_are_spaced() {
        let limiter = RateLimiter::per_second(4);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
