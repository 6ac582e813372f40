//! Authentication configuration.

use std::time::Duration;

use super::lockout::LockoutPolicy;
use super::password::PasswordPolicy;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingParams {
    /// Memory cost in KiB (default: 65_536 = 64 MiB).
    pub memory_kib: u32,
    /// Iterations (default: 3).
    pub iterations: u32,
    /// Lanes (default: 4).
    pub parallelism: u32,
}

impl HashingParams {
    /// Cheap parameters for tests and local tooling. Never use in production.
    pub const fn light() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }
}

impl Default for HashingParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Configuration for the credential flows.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT issuer (`iss` claim).
    pub jwt_issuer: String,
    /// Access token lifetime in seconds (default: 900 = 15 minutes).
    pub access_token_ttl_secs: u64,
    /// Refresh token lifetime in seconds (default: 1_209_600 = 14 days).
    pub refresh_token_ttl_secs: u64,
    /// Password reset token lifetime in seconds (default: 3600).
    pub password_reset_ttl_secs: u64,
    /// Email verification token lifetime in seconds (default: 86_400).
    pub email_verification_ttl_secs: u64,
    /// CSRF cookie lifetime in seconds (default: 86_400).
    pub csrf_token_ttl_secs: u64,
    /// Budget for login, refresh and reset store round trips (default: 10).
    pub store_timeout_secs: u64,
    pub hashing: HashingParams,
    pub password_policy: PasswordPolicy,
    pub lockout: LockoutPolicy,
}

impl AuthConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_issuer: "tally".into(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 1_209_600,
            password_reset_ttl_secs: 3600,
            email_verification_ttl_secs: 86_400,
            csrf_token_ttl_secs: 86_400,
            store_timeout_secs: 10,
            hashing: HashingParams::default(),
            password_policy: PasswordPolicy::default(),
            lockout: LockoutPolicy::default(),
        }
    }
}

/// Upper bound for any configured lifetime or lockout duration (10 years).
pub const MAX_LIFETIME_SECS: u64 = 315_360_000;

/// Convert a configured lifetime into a chrono duration, clamped to
/// [`MAX_LIFETIME_SECS`] so timestamp arithmetic cannot overflow.
pub(crate) fn ttl(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs.min(MAX_LIFETIME_SECS)).unwrap_or(0))
}
