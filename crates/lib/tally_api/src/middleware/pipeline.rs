//! Request guard pipeline.
//!
//! Protected requests pass an ordered list of guards over one
//! [`RequestContext`]. Each guard either fills in part of the context or
//! short-circuits with an error; later guards may rely on what earlier ones
//! produced.

use axum::http::{HeaderMap, Method, header::AUTHORIZATION};
use axum_extra::extract::cookie::CookieJar;
use tally_core::auth::AuthError;
use tally_core::auth::csrf::{CSRF_COOKIE, CSRF_HEADER, verify_double_submit};
use tally_core::auth::jwt::AccessClaims;
use tally_core::tenancy::TenantSession;

use crate::AppState;
use crate::error::AppError;

/// What the guards see of a request, plus what they derive from it.
#[derive(Default)]
pub struct RequestContext {
    pub method: Method,
    pub authorization: Option<String>,
    pub csrf_cookie: Option<String>,
    pub csrf_header: Option<String>,
    pub claims: Option<AccessClaims>,
    pub session: Option<TenantSession>,
}

impl RequestContext {
    pub fn from_parts(method: &Method, headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            method: method.clone(),
            authorization: header(AUTHORIZATION.as_str()),
            csrf_cookie: CookieJar::from_headers(headers)
                .get(CSRF_COOKIE)
                .map(|c| c.value().to_string()),
            csrf_header: header(CSRF_HEADER),
            claims: None,
            session: None,
        }
    }
}

pub type Guard = fn(&AppState, &mut RequestContext) -> Result<(), AppError>;

/// Guards for every authenticated route, in order.
pub const PROTECTED: &[Guard] = &[authenticate, verify_csrf, bind_tenant];

/// Run `guards` in order, stopping at the first failure.
pub fn run(guards: &[Guard], state: &AppState, ctx: &mut RequestContext) -> Result<(), AppError> {
    guards.iter().try_for_each(|guard| guard(state, ctx))
}

/// Verify the bearer access token.
pub fn authenticate(state: &AppState, ctx: &mut RequestContext) -> Result<(), AppError> {
    let header = ctx
        .authorization
        .as_deref()
        .ok_or_else(|| AuthError::TokenInvalid("missing authorization header".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AuthError::TokenInvalid("invalid authorization scheme".into()))?;
    ctx.claims = Some(state.auth.codec().verify(token.trim())?);
    Ok(())
}

/// Double-submit check for state-changing methods.
pub fn verify_csrf(_state: &AppState, ctx: &mut RequestContext) -> Result<(), AppError> {
    verify_double_submit(
        &ctx.method,
        ctx.csrf_cookie.as_deref(),
        ctx.csrf_header.as_deref(),
    )?;
    Ok(())
}

/// Open the request's tenant session from the verified claims.
pub fn bind_tenant(state: &AppState, ctx: &mut RequestContext) -> Result<(), AppError> {
    let claims = ctx
        .claims
        .as_ref()
        .ok_or_else(|| AppError::Internal("bind_tenant ran before authenticate".into()))?;
    ctx.session = Some(state.database.open_session(claims.tid));
    Ok(())
}
