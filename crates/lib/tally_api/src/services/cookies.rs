//! Cookie service: set/clear the refresh and CSRF cookies.
//!
//! The refresh cookie is httpOnly and only sent to `/auth`; the CSRF cookie is
//! script-readable so the client can echo it in `X-CSRF-Token`.

use axum_extra::extract::cookie::{Cookie, SameSite};
use tally_core::auth::csrf::CSRF_COOKIE;
use time::Duration;

/// Cookie name for the refresh token.
pub const REFRESH_COOKIE: &str = "tally_refresh";

const REFRESH_PATH: &str = "/auth";

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Build the httpOnly refresh token cookie.
pub fn refresh_cookie(token: &str, max_age_secs: u64, secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE.to_string(), token.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path(REFRESH_PATH)
        .max_age(secs(max_age_secs))
        .build()
}

/// Build the script-readable CSRF cookie.
pub fn csrf_cookie(token: &str, max_age_secs: u64, secure: bool) -> Cookie<'static> {
    Cookie::build((CSRF_COOKIE.to_string(), token.to_string()))
        .http_only(false)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(secs(max_age_secs))
        .build()
}

/// Build expired cookie to clear the refresh token.
pub fn clear_refresh_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE.to_string(), String::new()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path(REFRESH_PATH)
        .max_age(Duration::ZERO)
        .build()
}

/// Build expired cookie to clear the CSRF token.
pub fn clear_csrf_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((CSRF_COOKIE.to_string(), String::new()))
        .http_only(false)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_cookie_is_locked_down() {
        let cookie = refresh_cookie("secret", 60, true);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.path(), Some("/auth"));
        assert_eq!(cookie.max_age(), Some(Duration::seconds(60)));
    }

    #[test]
    fn csrf_cookie_is_script_readable() {
        let cookie = csrf_cookie("value", 60, true);
        assert_eq!(cookie.name(), "tally_csrf");
        assert_eq!(cookie.http_only(), Some(false));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.path(), Some("/"));
    }

    #[test]
    fn cleared_cookies_expire_immediately() {
        assert_eq!(clear_refresh_cookie(true).max_age(), Some(Duration::ZERO));
        assert_eq!(clear_csrf_cookie(true).value(), "");
    }
}
