//! Access token codec (HS256 JWT).
//!
//! Verification is a local signature and claims check. It never touches a
//! store, so it cannot block on anything external.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::AuthError;
use super::config::ttl;
use super::secrets::generate_secret;
use crate::models::{Role, TenantId};

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: Uuid,
    /// Active tenant.
    pub tid: TenantId,
    /// Role inside the active tenant.
    pub role: Role,
    pub email: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique token id.
    pub jti: Uuid,
}

/// Signs and verifies access tokens with one shared secret.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl_secs: u64,
}

impl TokenCodec {
    pub fn new(secret: &[u8], issuer: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Sign an access token for `user_id` acting in `tenant_id` as `role`.
    pub fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        tenant_id: TenantId,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(String, AccessClaims), AuthError> {
        let claims = AccessClaims {
            sub: user_id,
            tid: tenant_id,
            role,
            email: email.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl(self.ttl_secs)).timestamp(),
            jti: Uuid::now_v7(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))?;
        Ok((token, claims))
    }

    /// Verify signature, issuer and expiry.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;

        decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::TokenExpired,
                other => AuthError::TokenInvalid(format!("{other:?}")),
            })
    }
}

/// Resolve the signing secret: `JWT_SECRET` → `AUTH_SECRET` → secret file at
/// `path` (generated and persisted on first use).
pub fn resolve_jwt_secret(lookup: impl Fn(&str) -> Option<String>, path: &Path) -> String {
    for key in ["JWT_SECRET", "AUTH_SECRET"] {
        if let Some(secret) = lookup(key).filter(|s| !s.is_empty()) {
            return secret;
        }
    }
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return existing.to_string();
        }
    }

    let secret = generate_secret();
    let persisted = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::write(path, &secret));
    match persisted {
        Ok(()) => info!(path = %path.display(), "generated new JWT secret"),
        Err(e) => warn!(path = %path.display(), error = %e, "JWT secret could not be persisted; tokens will not survive a restart"),
    }
    secret
}

/// Default location of the persisted secret under the user data dir.
pub fn jwt_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("jwt-secret")
}
