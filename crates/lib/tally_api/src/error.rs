//! Application error types.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use tally_core::ErrorKind;
use tally_core::auth::AuthError;
use tally_core::tenancy::TenancyError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Tenancy(#[from] TenancyError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Auth(e) => e.kind(),
            AppError::Tenancy(e) => e.kind(),
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show the caller.
    fn public_message(&self) -> String {
        match self {
            _ if self.kind() == ErrorKind::Internal => "Internal server error".into(),
            AppError::Auth(AuthError::TokenInvalid(_)) => "Invalid access token".into(),
            AppError::Auth(e) => e.to_string(),
            AppError::Tenancy(e) => e.to_string(),
            AppError::Validation(m) | AppError::NotFound(m) | AppError::Forbidden(m) => m.clone(),
            AppError::Internal(_) => "Internal server error".into(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::AccountLocked => StatusCode::LOCKED,
        ErrorKind::Csrf | ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::TenantContextRequired | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        match kind {
            ErrorKind::Internal => error!(error = %self, "request failed"),
            ErrorKind::TenantContextRequired => {
                error!(error = %self, "tenant-scoped operation without tenant context")
            }
            _ => {}
        }

        let (tier, retry_after_secs) = match &self {
            AppError::Auth(AuthError::AccountLocked {
                tier,
                retry_after_secs,
            }) => (Some(*tier), Some(*retry_after_secs)),
            AppError::Auth(AuthError::RateLimited { retry_after_secs }) => {
                (None, Some(*retry_after_secs))
            }
            _ => (None, None),
        };
        let reason = match &self {
            AppError::Auth(e) => e.reason().map(str::to_string),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: kind.as_str().to_string(),
            message: self.public_message(),
            reason,
            tier,
            retry_after_secs,
        });
        let mut response = (status_for(kind), body).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
