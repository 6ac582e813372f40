//! Credential records: refresh tokens, one-time tokens and login attempts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tenant::TenantId;

/// Refresh token row. Only the SHA-256 digest of the secret is stored.
///
/// `family_id` links every token rotated out of one login; revoking the family
/// revokes the whole chain.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: TenantId,
    pub family_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for persisting the first token of a new chain.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: Uuid,
    pub tenant_id: TenantId,
    pub family_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of presenting a refresh token for rotation.
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    /// The presented token was current; it is now revoked and `successor` is current.
    Rotated {
        previous: RefreshTokenRecord,
        successor: RefreshTokenRecord,
    },
    /// The presented token had already been revoked. The whole family has
    /// been revoked in the same transaction.
    ReuseDetected { family_id: Uuid, user_id: Uuid },
    /// The presented token is past its expiry. Nothing was changed.
    Expired,
    /// No token with that hash exists.
    NotFound,
}

/// Immutable audit row for one login attempt.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    /// Normalised email the attempt was made for.
    pub email: String,
    /// Network origin (client address).
    pub origin: String,
    pub success: bool,
    pub attempted_at: DateTime<Utc>,
}

/// Aggregate of failed attempts inside a lookback window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureWindow {
    pub count: u32,
    pub last_failed_at: Option<DateTime<Utc>>,
}

/// What a single-use token may be spent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OneTimePurpose {
    PasswordReset,
    EmailVerification,
}

impl OneTimePurpose {
    /// Database text representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OneTimePurpose::PasswordReset => "password_reset",
            OneTimePurpose::EmailVerification => "email_verification",
        }
    }
}

impl fmt::Display for OneTimePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OneTimePurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password_reset" => Ok(OneTimePurpose::PasswordReset),
            "email_verification" => Ok(OneTimePurpose::EmailVerification),
            other => Err(format!("unknown one-time token purpose '{other}'")),
        }
    }
}

/// Password reset / email verification token row.
#[derive(Debug, Clone)]
pub struct OneTimeTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub purpose: OneTimePurpose,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for issuing a one-time token.
#[derive(Debug, Clone)]
pub struct NewOneTimeToken {
    pub user_id: Uuid,
    pub purpose: OneTimePurpose,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}
