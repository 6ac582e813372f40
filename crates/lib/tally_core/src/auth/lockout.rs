//! Brute-force guard.
//!
//! The lockout tier is recomputed on every attempt from the failed rows
//! inside the lookback window (the longest tier duration). Nothing is cached,
//! so two racing failures can only ever raise the count seen next time.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::AuthError;
use super::config::{MAX_LIFETIME_SECS, ttl};
use crate::models::{FailureWindow, LoginAttempt};
use crate::store::LoginAttemptStore;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid lockout policy: {0}")]
pub struct LockoutPolicyError(String);

/// One escalation step: `threshold` or more failures lock for `duration_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutTier {
    pub threshold: u32,
    pub duration_secs: u64,
}

/// Ordered escalation tiers.
///
/// Thresholds are strictly increasing and durations never decrease, so a
/// higher failure count can never produce a shorter lockout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutPolicy {
    tiers: Vec<LockoutTier>,
}

impl LockoutPolicy {
    pub fn new(tiers: Vec<LockoutTier>) -> Result<Self, LockoutPolicyError> {
        if tiers.is_empty() {
            return Err(LockoutPolicyError("at least one tier is required".into()));
        }
        if tiers.len() > usize::from(u8::MAX) {
            return Err(LockoutPolicyError("too many tiers".into()));
        }
        if tiers[0].threshold == 0 {
            return Err(LockoutPolicyError("thresholds must be positive".into()));
        }
        for pair in tiers.windows(2) {
            if pair[1].threshold <= pair[0].threshold {
                return Err(LockoutPolicyError(
                    "thresholds must be strictly increasing".into(),
                ));
            }
            if pair[1].duration_secs < pair[0].duration_secs {
                return Err(LockoutPolicyError("durations must not decrease".into()));
            }
        }
        if tiers.iter().any(|t| t.duration_secs > MAX_LIFETIME_SECS) {
            return Err(LockoutPolicyError(format!(
                "durations must not exceed {MAX_LIFETIME_SECS} seconds"
            )));
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[LockoutTier] {
        &self.tiers
    }

    /// Window in which failures count: the longest tier duration.
    pub fn lookback(&self) -> Duration {
        ttl(self
            .tiers
            .iter()
            .map(|t| t.duration_secs)
            .max()
            .unwrap_or(0))
    }

    /// 1-based tier number and tier for a failure count, if any applies.
    pub fn tier_for(&self, failures: u32) -> Option<(u8, LockoutTier)> {
        self.tiers
            .iter()
            .enumerate()
            .rev()
            .find(|(_, t)| failures >= t.threshold)
            .map(|(i, t)| (u8::try_from(i + 1).unwrap_or(u8::MAX), *t))
    }

    /// Decide whether a login may proceed given the failures in the window.
    pub fn evaluate(&self, window: FailureWindow, now: DateTime<Utc>) -> LockoutDecision {
        let (Some((tier, step)), Some(last)) = (self.tier_for(window.count), window.last_failed_at)
        else {
            return LockoutDecision::Allowed;
        };
        let until = last + ttl(step.duration_secs);
        if now >= until {
            return LockoutDecision::Allowed;
        }
        let remaining_ms = (until - now).num_milliseconds().max(0);
        let retry_after_secs = u64::try_from(remaining_ms).unwrap_or(0).div_ceil(1000);
        LockoutDecision::Locked {
            tier,
            retry_after_secs,
            until,
        }
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                LockoutTier {
                    threshold: 3,
                    duration_secs: 300,
                },
                LockoutTier {
                    threshold: 5,
                    duration_secs: 900,
                },
                LockoutTier {
                    threshold: 10,
                    duration_secs: 3600,
                },
                LockoutTier {
                    threshold: 15,
                    duration_secs: 86_400,
                },
            ],
        }
    }
}

/// Parses `threshold:seconds` pairs separated by commas, e.g. `3:300,5:900`.
impl FromStr for LockoutPolicy {
    type Err = LockoutPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tiers = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let (threshold, secs) = part
                    .split_once(':')
                    .ok_or_else(|| LockoutPolicyError(format!("'{part}' is not threshold:seconds")))?;
                Ok(LockoutTier {
                    threshold: threshold
                        .trim()
                        .parse()
                        .map_err(|_| LockoutPolicyError(format!("bad threshold in '{part}'")))?,
                    duration_secs: secs
                        .trim()
                        .parse()
                        .map_err(|_| LockoutPolicyError(format!("bad duration in '{part}'")))?,
                })
            })
            .collect::<Result<Vec<_>, LockoutPolicyError>>()?;
        Self::new(tiers)
    }
}

impl fmt::Display for LockoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .tiers
            .iter()
            .map(|t| format!("{}:{}", t.threshold, t.duration_secs))
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Outcome of evaluating the lockout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutDecision {
    Allowed,
    Locked {
        tier: u8,
        retry_after_secs: u64,
        until: DateTime<Utc>,
    },
}

/// Lockout policy bound to the attempt log.
#[derive(Clone)]
pub struct BruteForceGuard {
    store: Arc<dyn LoginAttemptStore>,
    policy: LockoutPolicy,
}

impl BruteForceGuard {
    pub fn new(store: Arc<dyn LoginAttemptStore>, policy: LockoutPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Fail with `AccountLocked` while a tier is active for the email or origin.
    pub async fn check(&self, email: &str, origin: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
        let since = now - self.policy.lookback();
        let window = self.store.failed_attempts_since(email, origin, since).await?;
        match self.policy.evaluate(window, now) {
            LockoutDecision::Allowed => Ok(()),
            LockoutDecision::Locked {
                tier,
                retry_after_secs,
                ..
            } => {
                warn!(
                    email,
                    origin,
                    failures = window.count,
                    tier,
                    retry_after_secs,
                    "login rejected: account locked"
                );
                Err(AuthError::AccountLocked {
                    tier,
                    retry_after_secs,
                })
            }
        }
    }

    /// Append the outcome of an attempt to the log.
    pub async fn record(
        &self,
        email: &str,
        origin: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        self.store
            .record_login_attempt(LoginAttempt {
                email: email.to_string(),
                origin: origin.to_string(),
                success,
                attempted_at: now,
            })
            .await?;
        Ok(())
    }

    /// Retention: drop attempts older than `cutoff`, but never anything still
    /// inside the lookback window.
    pub async fn prune(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let cutoff = cutoff.min(now - self.policy.lookback());
        let removed = self.store.prune_login_attempts(cutoff).await?;
        debug!(removed, %cutoff, "pruned login attempts");
        Ok(removed)
    }
}
