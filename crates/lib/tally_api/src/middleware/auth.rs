//! Authentication middleware: runs the guard pipeline for protected routes.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tally_core::auth::jwt::AccessClaims;

use super::pipeline::{self, PROTECTED, RequestContext};
use crate::AppState;
use crate::error::AppError;

/// Key used to store the verified `AccessClaims` in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub AccessClaims);

/// Axum middleware: verifies the bearer token and CSRF pair, then injects
/// `AuthenticatedUser` and the request's `TenantSession` into extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let mut ctx = RequestContext::from_parts(request.method(), request.headers());
    pipeline::run(PROTECTED, &state, &mut ctx)?;

    let (Some(claims), Some(session)) = (ctx.claims, ctx.session) else {
        return Err(AppError::Internal("guard pipeline left request unbound".into()));
    };
    request.extensions_mut().insert(AuthenticatedUser(claims));
    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}
