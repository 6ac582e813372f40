//! Error taxonomy shared by every layer.
//!
//! Domain errors (`AuthError`, `TenancyError`, ...) map onto one of these kinds;
//! the HTTP layer turns the kind into a status code and a stable error code.

use std::fmt;

/// Closed set of error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authentication,
    AccountLocked,
    Csrf,
    TenantContextRequired,
    Forbidden,
    Conflict,
    RateLimitExceeded,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Stable wire code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::AccountLocked => "ACCOUNT_LOCKED",
            ErrorKind::Csrf => "CSRF_ERROR",
            ErrorKind::TenantContextRequired => "TENANT_CONTEXT_REQUIRED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_screaming_snake_case() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::Authentication,
            ErrorKind::AccountLocked,
            ErrorKind::Csrf,
            ErrorKind::TenantContextRequired,
            ErrorKind::Forbidden,
            ErrorKind::Conflict,
            ErrorKind::RateLimitExceeded,
            ErrorKind::NotFound,
            ErrorKind::Internal,
        ];
        for kind in kinds {
            let code = kind.as_str();
            assert!(code.chars().all(|c| c.is_ascii_uppercase() || c == '_'), "{code}");
        }
        assert_eq!(ErrorKind::TenantContextRequired.to_string(), "TENANT_CONTEXT_REQUIRED");
    }
}
