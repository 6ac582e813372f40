//! Authentication request handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use tally_core::ErrorKind;
use tally_core::auth::AuthError;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::middleware::origin::ClientOrigin;
use crate::models::{
    AccessTokenResponse, ChangePasswordRequest, EmailRequest, LoginRequest, LogoutAllResponse,
    MeResponse, MessageResponse, RefreshRequest, RegisterRequest, RegisterResponse,
    ResetPasswordRequest, SwitchTenantRequest, TenantMembershipResponse, TenantResponse,
    TokenRequest, TokenResponse, UserResponse,
};
use crate::services::auth::SessionTokens;
use crate::services::cookies::{
    REFRESH_COOKIE, clear_csrf_cookie, clear_refresh_cookie, csrf_cookie, refresh_cookie,
};

const TOKEN_TYPE: &str = "Bearer";

/// Per-origin limit on the unauthenticated token endpoints.
fn rate_limit(state: &AppState, endpoint: &str, origin: &str) -> Result<(), AuthError> {
    state.rate_limiter.check(&format!("{endpoint}:{origin}"))
}

/// Set the refresh and CSRF cookies and build the token body.
fn session_response(
    state: &AppState,
    jar: CookieJar,
    tokens: SessionTokens,
) -> (CookieJar, Json<TokenResponse>) {
    let secure = state.config.cookie_secure;
    let auth = state.auth.config();
    let jar = jar
        .add(refresh_cookie(
            &tokens.refresh_token,
            auth.refresh_token_ttl_secs,
            secure,
        ))
        .add(csrf_cookie(&tokens.csrf_token, auth.csrf_token_ttl_secs, secure));
    let body = TokenResponse {
        access_token: tokens.access_token,
        token_type: TOKEN_TYPE.into(),
        expires_in: state.auth.codec().ttl_secs(),
        csrf_token: tokens.csrf_token,
        user: UserResponse::from(&tokens.user),
        tenant: TenantResponse::from(&tokens.tenant),
        role: tokens.role,
    };
    (jar, Json(body))
}

fn clear_session_cookies(state: &AppState, jar: CookieJar) -> CookieJar {
    let secure = state.config.cookie_secure;
    jar.add(clear_refresh_cookie(secure))
        .add(clear_csrf_cookie(secure))
}

/// `POST /auth/register`: create a user and their trial tenant.
pub async fn register_handler(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    let Json(body) = payload?;
    rate_limit(&state, "register", &origin)?;
    let registration = state
        .auth
        .register(&body.email, &body.password, body.tenant_name.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: UserResponse::from(&registration.user),
            tenant: TenantResponse::from(&registration.tenant),
            role: registration.membership.role,
        }),
    ))
}

/// `POST /auth/verify-email`: consume an email verification token.
pub async fn verify_email_handler(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let Json(body) = payload?;
    rate_limit(&state, "verify-email", &origin)?;
    state.auth.verify_email(&body.token).await?;
    Ok(Json(MessageResponse::new("Email address verified")))
}

/// `POST /auth/resend-verification`: always reports success.
pub async fn resend_verification_handler(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let Json(body) = payload?;
    rate_limit(&state, "resend-verification", &origin)?;
    state.auth.resend_verification(&body.email).await?;
    Ok(Json(MessageResponse::new(
        "If the account exists and is unverified, a verification email has been sent",
    )))
}

/// `POST /auth/login`: authenticate with email + password.
pub async fn login_handler(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<(CookieJar, Json<TokenResponse>)> {
    let Json(body) = payload?;
    let tokens = state
        .auth
        .login(&body.email, &body.password, &origin, body.tenant_id)
        .await?;
    Ok(session_response(&state, jar, tokens))
}

/// `POST /auth/refresh`: rotate the refresh token from the cookie (or body).
///
/// CSRF-exempt; the refresh cookie is `SameSite=Strict` and path-scoped.
/// A rejected token clears both cookies.
pub async fn refresh_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Bytes,
) -> AppResult<Response> {
    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<RefreshRequest>(&body)
            .map_err(|e| AppError::Validation(format!("invalid request body: {e}")))?
            .refresh_token
    };
    let presented = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .or(from_body)
        .unwrap_or_default();

    match state.auth.refresh(&presented).await {
        Ok(tokens) => Ok(session_response(&state, jar, tokens).into_response()),
        Err(e) if matches!(e.kind(), ErrorKind::Authentication | ErrorKind::Forbidden) => {
            Ok((clear_session_cookies(&state, jar), AppError::from(e)).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

/// `POST /auth/logout`: revoke the current refresh token.
pub async fn logout_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<MessageResponse>)> {
    let presented = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string());
    state.auth.logout(claims.sub, presented.as_deref()).await?;
    Ok((
        clear_session_cookies(&state, jar),
        Json(MessageResponse::new("Logged out")),
    ))
}

/// `POST /auth/logout-all`: revoke every refresh token of the caller.
pub async fn logout_all_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<LogoutAllResponse>)> {
    let revoked = state.auth.logout_all(claims.sub).await?;
    Ok((
        clear_session_cookies(&state, jar),
        Json(LogoutAllResponse { revoked }),
    ))
}

/// `POST /auth/forgot-password`: always reports success.
pub async fn forgot_password_handler(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let Json(body) = payload?;
    rate_limit(&state, "forgot-password", &origin)?;
    state.auth.forgot_password(&body.email).await?;
    Ok(Json(MessageResponse::new(
        "If the account exists, a password reset email has been sent",
    )))
}

/// `POST /auth/reset-password`: consume a reset token and set a new password.
pub async fn reset_password_handler(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> AppResult<Json<MessageResponse>> {
    let Json(body) = payload?;
    rate_limit(&state, "reset-password", &origin)?;
    state
        .auth
        .reset_password(&body.token, &body.new_password)
        .await?;
    Ok(Json(MessageResponse::new(
        "Password reset; all sessions have been signed out",
    )))
}

/// `POST /auth/change-password`: verify the current password, set a new one.
pub async fn change_password_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    jar: CookieJar,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> AppResult<(CookieJar, Json<MessageResponse>)> {
    let Json(body) = payload?;
    state
        .auth
        .change_password(claims.sub, &body.current_password, &body.new_password)
        .await?;
    Ok((
        clear_session_cookies(&state, jar),
        Json(MessageResponse::new(
            "Password changed; all sessions have been signed out",
        )),
    ))
}

/// `POST /auth/switch-tenant`: mint an access token for another membership.
pub async fn switch_tenant_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
    payload: Result<Json<SwitchTenantRequest>, JsonRejection>,
) -> AppResult<Json<AccessTokenResponse>> {
    let Json(body) = payload?;
    let grant = state.auth.switch_tenant(&claims, body.tenant_id).await?;
    Ok(Json(AccessTokenResponse {
        access_token: grant.access_token,
        token_type: TOKEN_TYPE.into(),
        expires_in: state.auth.codec().ttl_secs(),
        tenant: TenantResponse::from(&grant.tenant),
        role: grant.role,
    }))
}

/// `GET /auth/me`: current identity, active tenant and all memberships.
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(claims)): Extension<AuthenticatedUser>,
) -> AppResult<Json<MeResponse>> {
    let identity = state.auth.me(&claims).await?;
    Ok(Json(MeResponse {
        user: UserResponse::from(&identity.user),
        active_tenant: TenantMembershipResponse::from(&identity.active),
        tenants: identity
            .tenants
            .iter()
            .map(TenantMembershipResponse::from)
            .collect(),
    }))
}
