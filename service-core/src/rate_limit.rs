//! Keyed in-memory rate limiting for background jobs.

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by an arbitrary string (e.g. "user:account").
pub type KeyedRateLimiter = Arc<RateLimiter<String, DashMapStateStore<String>, DefaultClock>>;

/// Create a keyed rate limiter allowing `attempts` per `window_seconds` for each key.
pub fn create_keyed_rate_limiter(attempts: u32, window_seconds: u64) -> KeyedRateLimiter {
    let attempts = NonZeroU32::new(attempts.max(1)).unwrap_or(NonZeroU32::MIN);
    let window_ms = window_seconds.max(1) * 1000;
    let period = Duration::from_millis((window_ms / u64::from(attempts.get())).max(1));
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(attempts))
        .allow_burst(attempts);

    Arc::new(RateLimiter::dashmap(quota))
}

/// Check a key against the limiter. Returns the wait time in seconds when the
/// key is over its quota.
pub fn check_key(limiter: &KeyedRateLimiter, key: &str) -> Result<(), u64> {
    limiter.check_key(&key.to_string()).map_err(|negative| {
        negative
            .wait_time_from(DefaultClock::default().now())
            .as_secs()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_limiter_isolates_keys() {
        let limiter = create_keyed_rate_limiter(1, 3600);
        assert!(check_key(&limiter, "user-a:acct-1").is_ok());
        assert!(check_key(&limiter, "user-a:acct-1").is_err());
        assert!(check_key(&limiter, "user-a:acct-2").is_ok());
    }
}
