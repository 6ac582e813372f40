//! Refresh token ledger.
//!
//! Raw refresh tokens are opaque 256-bit secrets handed to the client once.
//! Only their SHA-256 digest is stored. Every login starts a family; each
//! refresh revokes the presented token and adds its successor to the same
//! family in one atomic store call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::AuthError;
use super::config::ttl;
use super::secrets::{generate_secret, sha256_hex};
use crate::models::{NewRefreshToken, RefreshTokenRecord, RotateOutcome, TenantId};
use crate::store::RefreshTokenStore;

/// A refresh token handed to the client plus its stored row.
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub record: RefreshTokenRecord,
}

#[derive(Clone)]
pub struct RefreshLedger {
    store: Arc<dyn RefreshTokenStore>,
    ttl_secs: u64,
}

impl RefreshLedger {
    pub fn new(store: Arc<dyn RefreshTokenStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Start a new family for a fresh login.
    pub async fn issue(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<IssuedRefreshToken, AuthError> {
        let token = generate_secret();
        let record = self
            .store
            .store_refresh_token(NewRefreshToken {
                user_id,
                tenant_id,
                family_id: Uuid::now_v7(),
                token_hash: sha256_hex(&token),
                expires_at: now + ttl(self.ttl_secs),
            })
            .await?;
        Ok(IssuedRefreshToken { token, record })
    }

    /// Exchange a current token for its successor.
    ///
    /// Presenting a token that was already rotated or revoked revokes the
    /// whole family and fails with `RefreshTokenReused`.
    pub async fn rotate(
        &self,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedRefreshToken, AuthError> {
        let successor = generate_secret();
        let outcome = self
            .store
            .rotate_refresh_token(
                &sha256_hex(presented),
                &sha256_hex(&successor),
                now + ttl(self.ttl_secs),
                now,
            )
            .await?;

        match outcome {
            RotateOutcome::Rotated { successor: record, .. } => Ok(IssuedRefreshToken {
                token: successor,
                record,
            }),
            RotateOutcome::ReuseDetected { family_id, user_id } => {
                warn!(%family_id, %user_id, "refresh token reuse detected; family revoked");
                Err(AuthError::RefreshTokenReused)
            }
            RotateOutcome::Expired => Err(AuthError::RefreshTokenExpired),
            RotateOutcome::NotFound => Err(AuthError::RefreshTokenInvalid),
        }
    }

    /// Look up the stored row for a presented token.
    pub async fn find(&self, presented: &str) -> Result<Option<RefreshTokenRecord>, AuthError> {
        Ok(self.store.find_refresh_token(&sha256_hex(presented)).await?)
    }

    /// Revoke one token. Returns the row if it was still active.
    pub async fn revoke(&self, presented: &str) -> Result<Option<RefreshTokenRecord>, AuthError> {
        Ok(self
            .store
            .revoke_refresh_token(&sha256_hex(presented))
            .await?)
    }

    pub async fn revoke_family(&self, family_id: Uuid) -> Result<u64, AuthError> {
        Ok(self.store.revoke_refresh_family(family_id).await?)
    }

    /// Revoke every token of the user on every device.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(self.store.revoke_all_refresh_tokens(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ledger() -> (Arc<MemoryStore>, RefreshLedger) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), RefreshLedger::new(store, 3600))
    }

    #[tokio::test]
    async fn only_the_digest_is_stored() {
        let (store, ledger) = ledger();
        let issued = ledger
            .issue(Uuid::now_v7(), TenantId::generate(), Utc::now())
            .await
            .unwrap();
        assert_ne!(issued.record.token_hash, issued.token);
        let found = store
            .find_refresh_token(&sha256_hex(&issued.token))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn find_resolves_the_presented_token() {
        let (_, ledger) = ledger();
        let user = Uuid::now_v7();
        let issued = ledger.issue(user, TenantId::generate(), Utc::now()).await.unwrap();
        let found = ledger.find(&issued.token).await.unwrap().unwrap();
        assert_eq!(found.user_id, user);
        assert!(ledger.find("not-a-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotation_keeps_family_and_tenant() {
        let (_, ledger) = ledger();
        let now = Utc::now();
        let tenant = TenantId::generate();
        let first = ledger.issue(Uuid::now_v7(), tenant, now).await.unwrap();
        let second = ledger.rotate(&first.token, now).await.unwrap();
        assert_eq!(second.record.family_id, first.record.family_id);
        assert_eq!(second.record.tenant_id, tenant);
        assert_ne!(second.token, first.token);
    }

    #[tokio::test]
    async fn second_presentation_revokes_chain() {
        let (_, ledger) = ledger();
        let now = Utc::now();
        let first = ledger
            .issue(Uuid::now_v7(), TenantId::generate(), now)
            .await
            .unwrap();
        let second = ledger.rotate(&first.token, now).await.unwrap();

        assert!(matches!(
            ledger.rotate(&first.token, now).await,
            Err(AuthError::RefreshTokenReused)
        ));
        assert!(matches!(
            ledger.rotate(&second.token, now).await,
            Err(AuthError::RefreshTokenReused)
        ));
    }

    #[tokio::test]
    async fn concurrent_rotations_yield_one_winner() {
        let (_, ledger) = ledger();
        let now = Utc::now();
        let first = ledger
            .issue(Uuid::now_v7(), TenantId::generate(), now)
            .await
            .unwrap();

        let (a, b) = tokio::join!(ledger.rotate(&first.token, now), ledger.rotate(&first.token, now));
        let wins = [a.is_ok(), b.is_ok()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
        let winner = a.or(b).unwrap();
        assert!(ledger.rotate(&winner.token, now).await.is_err());
    }

    #[tokio::test]
    async fn expired_and_unknown_tokens_fail_distinctly() {
        let (_, ledger) = ledger();
        let now = Utc::now();
        let issued = ledger
            .issue(Uuid::now_v7(), TenantId::generate(), now)
            .await
            .unwrap();
        let later = now + chrono::Duration::seconds(3601);
        assert!(matches!(
            ledger.rotate(&issued.token, later).await,
            Err(AuthError::RefreshTokenExpired)
        ));
        assert!(matches!(
            ledger.rotate("never-issued", now).await,
            Err(AuthError::RefreshTokenInvalid)
        ));
    }

    #[tokio::test]
    async fn revoke_all_covers_every_family() {
        let (_, ledger) = ledger();
        let now = Utc::now();
        let user = Uuid::now_v7();
        let a = ledger.issue(user, TenantId::generate(), now).await.unwrap();
        let b = ledger.issue(user, TenantId::generate(), now).await.unwrap();
        assert_eq!(ledger.revoke_all(user).await.unwrap(), 2);
        assert!(ledger.rotate(&a.token, now).await.is_err());
        assert!(ledger.rotate(&b.token, now).await.is_err());
    }
}
