//! API server configuration.

use std::fmt;
use std::str::FromStr;

use tally_core::auth::config::{AuthConfig, HashingParams, MAX_LIFETIME_SECS};
use tally_core::auth::jwt::{jwt_secret_path, resolve_jwt_secret};
use tally_core::auth::lockout::LockoutPolicy;
use tally_core::tenancy::IsolationMode;
use thiserror::Error;

/// A variable that is set but cannot be used.
#[derive(Debug, Error)]
#[error("invalid value for {var}: {message}")]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

/// Configuration for the API server.
#[derive(Clone)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub pg_connection_url: String,
    /// JWT signing secret.
    pub jwt_secret: String,
    /// What a tenant-scoped operation does without a bound tenant.
    pub isolation_mode: IsolationMode,
    pub auth: AuthConfig,
    /// Mark auth cookies `Secure`. Only disable for plain-HTTP development.
    pub cookie_secure: bool,
    /// Take the client origin from `X-Forwarded-For` (behind a trusted proxy).
    pub trust_forwarded_for: bool,
    /// Requests per origin per minute on the unauthenticated mail-sending
    /// and token endpoints. `0` disables the limiter.
    pub rate_limit_per_minute: u32,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("pg_connection_url", &"<redacted>")
            .field("jwt_secret", &"<redacted>")
            .field("isolation_mode", &self.isolation_mode)
            .field("auth", &self.auth)
            .field("cookie_secure", &self.cookie_secure)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .finish()
    }
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                        | Default                                  |
    /// |---------------------------------|------------------------------------------|
    /// | `BIND_ADDR`                     | `127.0.0.1:3100`                         |
    /// | `DATABASE_URL`                  | `postgres://localhost:5432/tally`        |
    /// | `JWT_SECRET` / `AUTH_SECRET`    | generated & persisted to file            |
    /// | `JWT_ISSUER`                    | `tally`                                  |
    /// | `TENANT_ISOLATION_MODE`         | `strict`                                 |
    /// | `ACCESS_TOKEN_TTL_SECS`         | `900`                                    |
    /// | `REFRESH_TOKEN_TTL_SECS`        | `1209600`                                |
    /// | `PASSWORD_RESET_TTL_SECS`       | `3600`                                   |
    /// | `EMAIL_VERIFICATION_TTL_SECS`   | `86400`                                  |
    /// | `CSRF_TOKEN_TTL_SECS`           | `86400`                                  |
    /// | `LOCKOUT_TIERS`                 | `3:300,5:900,10:3600,15:86400`           |
    /// | `ARGON2_MEMORY_KIB`             | `65536`                                  |
    /// | `ARGON2_ITERATIONS`             | `3`                                      |
    /// | `ARGON2_PARALLELISM`            | `4`                                      |
    /// | `STORE_TIMEOUT_SECS`            | `10`                                     |
    /// | `COOKIE_SECURE`                 | `true`                                   |
    /// | `TRUST_FORWARDED_FOR`           | `false`                                  |
    /// | `RATE_LIMIT_PER_MINUTE`         | `10`                                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ApiConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = AuthConfig::default();
        let hashing = HashingParams {
            memory_kib: parse_or(&lookup, "ARGON2_MEMORY_KIB", defaults.hashing.memory_kib)?,
            iterations: parse_or(&lookup, "ARGON2_ITERATIONS", defaults.hashing.iterations)?,
            parallelism: parse_or(&lookup, "ARGON2_PARALLELISM", defaults.hashing.parallelism)?,
        };
        let lockout = match non_empty(&lookup, "LOCKOUT_TIERS") {
            Some(raw) => LockoutPolicy::from_str(&raw).map_err(|e| ConfigError {
                var: "LOCKOUT_TIERS",
                message: e.to_string(),
            })?,
            None => defaults.lockout.clone(),
        };

        let auth = AuthConfig {
            jwt_issuer: non_empty(&lookup, "JWT_ISSUER").unwrap_or(defaults.jwt_issuer),
            access_token_ttl_secs: lifetime(
                &lookup,
                "ACCESS_TOKEN_TTL_SECS",
                defaults.access_token_ttl_secs,
            )?,
            refresh_token_ttl_secs: lifetime(
                &lookup,
                "REFRESH_TOKEN_TTL_SECS",
                defaults.refresh_token_ttl_secs,
            )?,
            password_reset_ttl_secs: lifetime(
                &lookup,
                "PASSWORD_RESET_TTL_SECS",
                defaults.password_reset_ttl_secs,
            )?,
            email_verification_ttl_secs: lifetime(
                &lookup,
                "EMAIL_VERIFICATION_TTL_SECS",
                defaults.email_verification_ttl_secs,
            )?,
            csrf_token_ttl_secs: lifetime(
                &lookup,
                "CSRF_TOKEN_TTL_SECS",
                defaults.csrf_token_ttl_secs,
            )?,
            store_timeout_secs: positive(&lookup, "STORE_TIMEOUT_SECS", defaults.store_timeout_secs)?,
            hashing,
            password_policy: defaults.password_policy,
            lockout,
        };

        Ok(Self {
            bind_addr: non_empty(&lookup, "BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3100".into()),
            pg_connection_url: non_empty(&lookup, "DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost:5432/tally".into()),
            jwt_secret: resolve_jwt_secret(&lookup, &jwt_secret_path()),
            isolation_mode: parse_or(&lookup, "TENANT_ISOLATION_MODE", IsolationMode::Strict)?,
            auth,
            cookie_secure: flag(&lookup, "COOKIE_SECURE", true)?,
            trust_forwarded_for: flag(&lookup, "TRUST_FORWARDED_FOR", false)?,
            rate_limit_per_minute: parse_or(&lookup, "RATE_LIMIT_PER_MINUTE", 10)?,
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match non_empty(lookup, var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError {
            var,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parse_or(lookup, var, default)? {
        0 => Err(ConfigError {
            var,
            message: "must be greater than zero".into(),
        }),
        n => Ok(n),
    }
}

/// A positive number of seconds no longer than [`MAX_LIFETIME_SECS`].
fn lifetime(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match positive(lookup, var, default)? {
        n if n > MAX_LIFETIME_SECS => Err(ConfigError {
            var,
            message: format!("must not exceed {MAX_LIFETIME_SECS} seconds"),
        }),
        n => Ok(n),
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match non_empty(lookup, var).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError {
            var,
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ApiConfig, ConfigError> {
        let mut env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.entry("JWT_SECRET".into())
            .or_insert_with(|| "test-secret".into());
        ApiConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:3100");
        assert_eq!(cfg.isolation_mode, IsolationMode::Strict);
        assert_eq!(cfg.auth.access_token_ttl_secs, 900);
        assert_eq!(cfg.auth.refresh_token_ttl_secs, 1_209_600);
        assert!(cfg.cookie_secure);
        assert!(!cfg.trust_forwarded_for);
        assert_eq!(cfg.rate_limit_per_minute, 10);
        assert_eq!(cfg.jwt_secret, "test-secret");
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("TENANT_ISOLATION_MODE", "Permissive"),
            ("ACCESS_TOKEN_TTL_SECS", "60"),
            ("LOCKOUT_TIERS", "2:10,4:20"),
            ("COOKIE_SECURE", "false"),
            ("ARGON2_MEMORY_KIB", "1024"),
        ])
        .unwrap();
        assert_eq!(cfg.isolation_mode, IsolationMode::Permissive);
        assert_eq!(cfg.auth.access_token_ttl_secs, 60);
        assert_eq!(cfg.auth.lockout.to_string(), "2:10,4:20");
        assert!(!cfg.cookie_secure);
        assert_eq!(cfg.auth.hashing.memory_kib, 1024);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("TENANT_ISOLATION_MODE", "loose")]).unwrap_err();
        assert_eq!(err.var, "TENANT_ISOLATION_MODE");

        let err = config(&[("LOCKOUT_TIERS", "5:60,3:120")]).unwrap_err();
        assert_eq!(err.var, "LOCKOUT_TIERS");

        let err = config(&[("REFRESH_TOKEN_TTL_SECS", "0")]).unwrap_err();
        assert_eq!(err.var, "REFRESH_TOKEN_TTL_SECS");

        let err = config(&[("TRUST_FORWARDED_FOR", "maybe")]).unwrap_err();
        assert_eq!(err.var, "TRUST_FORWARDED_FOR");
    }

    #[test]
    fn lifetimes_beyond_ten_years_are_rejected() {
        let err = config(&[("ACCESS_TOKEN_TTL_SECS", "9223372036854775")]).unwrap_err();
        assert_eq!(err.var, "ACCESS_TOKEN_TTL_SECS");

        let err = config(&[("CSRF_TOKEN_TTL_SECS", "315360001")]).unwrap_err();
        assert_eq!(err.var, "CSRF_TOKEN_TTL_SECS");

        let err = config(&[("LOCKOUT_TIERS", "3:300,5:9223372036854775")]).unwrap_err();
        assert_eq!(err.var, "LOCKOUT_TIERS");

        let cfg = config(&[("REFRESH_TOKEN_TTL_SECS", "315360000")]).unwrap();
        assert_eq!(cfg.auth.refresh_token_ttl_secs, MAX_LIFETIME_SECS);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = config(&[("DATABASE_URL", "postgres://u:pw@db/tally")]).unwrap();
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("test-secret"));
        assert!(!debug.contains("pw@db"));
    }
}
