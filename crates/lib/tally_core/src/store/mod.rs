//! Persistence seams for the credential core.
//!
//! Four object-safe traits cover the rows the auth flows touch. `MemoryStore`
//! implements all of them in-process; `PgStore` implements them on PostgreSQL.
//! Rows are only ever appended or have a flag flipped (revoked / used); nothing
//! here edits a credential record destructively.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{
    FailureWindow, LoginAttempt, Membership, NewOneTimeToken, NewRefreshToken, NewTenant, NewUser,
    OneTimePurpose, OneTimeTokenRecord, RefreshTokenRecord, Role, RotateOutcome, Tenant,
    TenantAccess, TenantId, TenantStatus, User, UserCredentials,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Db(_) | StoreError::Corrupt(_) => ErrorKind::Internal,
        }
    }
}

/// Users, tenants and memberships.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create a user, a tenant and an owner membership atomically.
    ///
    /// Fails with `StoreError::Conflict` when the email is already registered.
    async fn register_owner(
        &self,
        user: NewUser,
        tenant: NewTenant,
    ) -> Result<(User, Tenant, Membership), StoreError>;

    async fn find_user_by_email(&self, email: &str)
    -> Result<Option<UserCredentials>, StoreError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserCredentials>, StoreError>;

    async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), StoreError>;

    /// Set a new password hash and revoke every refresh token of the user as
    /// one atomic step. Returns the number of tokens revoked.
    async fn replace_password_hash(&self, user_id: Uuid, password_hash: &str)
    -> Result<u64, StoreError>;

    async fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant, StoreError>;

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn set_tenant_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
    ) -> Result<(), StoreError>;

    async fn add_membership(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        role: Role,
    ) -> Result<Membership, StoreError>;

    async fn set_membership_active(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        active: bool,
    ) -> Result<(), StoreError>;

    async fn find_membership(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
    ) -> Result<Option<Membership>, StoreError>;

    /// Every membership of the user joined with its tenant, oldest first.
    async fn list_tenant_access(&self, user_id: Uuid) -> Result<Vec<TenantAccess>, StoreError>;
}

/// Refresh token ledger rows.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn store_refresh_token(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshTokenRecord, StoreError>;

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Atomically revoke the presented token and create its successor in the
    /// same family. Presenting an already revoked token revokes the family.
    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor_hash: &str,
        successor_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError>;

    /// Revoke one token. Returns the record when it was active before the call.
    async fn revoke_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    async fn revoke_refresh_family(&self, family_id: Uuid) -> Result<u64, StoreError>;

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, StoreError>;
}

/// Append-only login attempt log.
#[async_trait]
pub trait LoginAttemptStore: Send + Sync {
    async fn record_login_attempt(&self, attempt: LoginAttempt) -> Result<(), StoreError>;

    /// Failed attempts since `since` whose email **or** origin matches.
    async fn failed_attempts_since(
        &self,
        email: &str,
        origin: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError>;

    /// Retention: delete attempts older than `cutoff`.
    async fn prune_login_attempts(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Password reset and email verification tokens.
#[async_trait]
pub trait OneTimeTokenStore: Send + Sync {
    async fn store_one_time_token(
        &self,
        token: NewOneTimeToken,
    ) -> Result<OneTimeTokenRecord, StoreError>;

    /// Mark the token used if it exists, is unused and unexpired. Returns the
    /// consumed record, or `None` when it could not be consumed.
    async fn consume_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OneTimeTokenRecord>, StoreError>;

    /// Mark every unused token of this purpose for the user as used.
    async fn invalidate_one_time_tokens(
        &self,
        user_id: Uuid,
        purpose: OneTimePurpose,
    ) -> Result<u64, StoreError>;
}

/// The four stores the auth flows depend on.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub login_attempts: Arc<dyn LoginAttemptStore>,
    pub one_time_tokens: Arc<dyn OneTimeTokenStore>,
}

impl Stores {
    /// Use one backing store for every seam.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: CredentialStore + RefreshTokenStore + LoginAttemptStore + OneTimeTokenStore + 'static,
    {
        Self {
            credentials: store.clone(),
            refresh_tokens: store.clone(),
            login_attempts: store.clone(),
            one_time_tokens: store,
        }
    }
}

/// Normalise an email for storage and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalisation_trims_and_lowercases() {
        assert_eq!(normalize_email("  A@X.com "), "a@x.com");
    }
}
