//! Authentication and session security primitives.
//!
//! Password hashing, access-token codec, refresh-token ledger, brute-force
//! guard, CSRF double-submit check and single-use tokens. The HTTP layer
//! composes these into the public flows.

pub mod config;
pub mod csrf;
pub mod jwt;
pub mod ledger;
pub mod lockout;
pub mod notify;
pub mod one_time;
pub mod password;
pub mod secrets;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::store::StoreError;

/// Authentication errors.
///
/// Each failure mode is its own variant; `kind()` groups them into the public
/// taxonomy and `reason()` keeps the sub-kind visible to clients.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Email address has not been verified")]
    EmailNotVerified,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Account locked (tier {tier}), retry after {retry_after_secs}s")]
    AccountLocked { tier: u8, retry_after_secs: u64 },

    #[error("Invalid access token: {0}")]
    TokenInvalid(String),

    #[error("Access token has expired")]
    TokenExpired,

    #[error("Invalid refresh token")]
    RefreshTokenInvalid,

    #[error("Refresh token has expired")]
    RefreshTokenExpired,

    #[error("Refresh token has already been used")]
    RefreshTokenReused,

    #[error("Invalid or expired token")]
    OneTimeTokenInvalid,

    #[error("CSRF validation failed: {0}")]
    Csrf(String),

    #[error("Tenant access denied: {0}")]
    TenantAccessDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Operation timed out: {0}")]
    Timeout(&'static str),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Validation(_) => ErrorKind::Validation,
            AuthError::InvalidCredentials
            | AuthError::EmailNotVerified
            | AuthError::AccountDisabled
            | AuthError::TokenInvalid(_)
            | AuthError::TokenExpired
            | AuthError::RefreshTokenInvalid
            | AuthError::RefreshTokenExpired
            | AuthError::RefreshTokenReused
            | AuthError::OneTimeTokenInvalid => ErrorKind::Authentication,
            AuthError::AccountLocked { .. } => ErrorKind::AccountLocked,
            AuthError::Csrf(_) => ErrorKind::Csrf,
            AuthError::TenantAccessDenied(_) => ErrorKind::Forbidden,
            AuthError::Conflict(_) => ErrorKind::Conflict,
            AuthError::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            AuthError::Store(e) => e.kind(),
            AuthError::Timeout(_) | AuthError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Machine-readable sub-kind for authentication failures.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            AuthError::InvalidCredentials => Some("invalid_credentials"),
            AuthError::EmailNotVerified => Some("email_not_verified"),
            AuthError::AccountDisabled => Some("account_disabled"),
            AuthError::TokenInvalid(_) => Some("token_invalid"),
            AuthError::TokenExpired => Some("token_expired"),
            AuthError::RefreshTokenInvalid => Some("refresh_token_invalid"),
            AuthError::RefreshTokenExpired => Some("refresh_token_expired"),
            AuthError::RefreshTokenReused => Some("refresh_token_reused"),
            AuthError::OneTimeTokenInvalid => Some("one_time_token_invalid"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_share_a_kind_but_not_a_reason() {
        let errors = [
            AuthError::InvalidCredentials,
            AuthError::EmailNotVerified,
            AuthError::RefreshTokenReused,
        ];
        let reasons: Vec<_> = errors.iter().map(|e| e.reason()).collect();
        assert!(errors.iter().all(|e| e.kind() == ErrorKind::Authentication));
        assert_eq!(
            reasons,
            vec![
                Some("invalid_credentials"),
                Some("email_not_verified"),
                Some("refresh_token_reused")
            ]
        );
    }

    #[test]
    fn tenant_switch_denial_is_forbidden() {
        assert_eq!(
            AuthError::TenantAccessDenied("no membership".into()).kind(),
            ErrorKind::Forbidden
        );
    }

    #[test]
    fn store_conflict_surfaces_as_conflict() {
        let err = AuthError::from(StoreError::Conflict("email taken".into()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
