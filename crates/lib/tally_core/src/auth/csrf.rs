//! Stateless double-submit CSRF check.
//!
//! The value lives only in a script-readable cookie; callers echo it in a
//! header. No server-side state is kept.

use http::Method;

use super::AuthError;
use super::secrets::{constant_time_eq, generate_secret};

/// Script-readable cookie carrying the CSRF value.
pub const CSRF_COOKIE: &str = "tally_csrf";

/// Header the client echoes the cookie value in.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Fresh CSRF value.
pub fn generate_csrf_token() -> String {
    generate_secret()
}

/// Methods that never change state and skip the check entirely.
pub fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Compare the cookie and header values for a state-changing request.
pub fn verify_double_submit(
    method: &Method,
    cookie: Option<&str>,
    header: Option<&str>,
) -> Result<(), AuthError> {
    if is_safe_method(method) {
        return Ok(());
    }
    let cookie = cookie
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::Csrf("missing CSRF cookie".into()))?;
    let header = header
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::Csrf("missing CSRF header".into()))?;
    if !constant_time_eq(cookie, header) {
        return Err(AuthError::Csrf("CSRF token mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_methods_are_never_checked() {
        for method in [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE] {
            assert!(verify_double_submit(&method, None, None).is_ok());
            assert!(verify_double_submit(&method, Some("a"), Some("b")).is_ok());
        }
    }

    #[test]
    fn matching_values_pass() {
        let token = generate_csrf_token();
        assert!(verify_double_submit(&Method::POST, Some(&token), Some(&token)).is_ok());
    }

    #[test]
    fn missing_header_is_rejected() {
        let err = verify_double_submit(&Method::POST, Some("abc"), None).unwrap_err();
        assert!(matches!(err, AuthError::Csrf(_)));
    }

    #[test]
    fn missing_cookie_is_rejected() {
        assert!(verify_double_submit(&Method::DELETE, None, Some("abc")).is_err());
    }

    #[test]
    fn mismatch_is_rejected() {
        assert!(verify_double_submit(&Method::PATCH, Some("abc"), Some("abd")).is_err());
        assert!(verify_double_submit(&Method::PUT, Some(""), Some("")).is_err());
    }
}
