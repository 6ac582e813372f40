//! Fixed-window request limiter keyed by origin and endpoint.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tally_core::auth::AuthError;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-process limiter. State is per instance and lost on restart.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    /// `limit` requests per key per minute; `0` disables limiting.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), AuthError> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), AuthError> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= WINDOW {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= self.limit {
            let remaining = WINDOW.saturating_sub(elapsed);
            return Err(AuthError::RateLimited {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }
        window.count += 1;
        Ok(())
    }

    /// Drop windows that have already closed.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < WINDOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_applies_per_key_within_window() {
        let limiter = RateLimiter::new(2);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("a", t0).is_ok());
        let err = limiter.check_at("a", t0 + Duration::from_secs(20)).unwrap_err();
        assert!(matches!(
            err,
            AuthError::RateLimited {
                retry_after_secs: 40
            }
        ));
        assert!(limiter.check_at("b", t0).is_ok());
    }

    #[test]
    fn window_resets_after_a_minute() {
        let limiter = RateLimiter::new(1);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("a", t0).is_err());
        assert!(limiter.check_at("a", t0 + WINDOW).is_ok());
    }

    #[test]
    fn zero_disables_limiting() {
        let limiter = RateLimiter::new(0);
        let t0 = Instant::now();
        for _ in 0..100 {
            assert!(limiter.check_at("a", t0).is_ok());
        }
    }
}
