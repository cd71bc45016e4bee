//! Resilience helpers shared by exchange clients
//!
//! - Circuit breaker that fails fast while the exchange is unhealthy
//! - Request pacing to stay under the exchange's rate limit
//! - Exponential backoff schedule for retries

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::RateLimiter;

use std::time::Duration;

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(3);
        assert_eq!(backoff_delay(base, 1, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 4, cap), cap);
        assert_eq!(backoff_delay(base, 40, cap), cap);
    }
}
