//! In-process store.
//!
//! Every operation takes the single state lock for its whole duration, which
//! gives the same all-or-nothing behaviour the PostgreSQL store gets from
//! transactions. Used by tests and by the server's `--in-memory` mode.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CredentialStore, LoginAttemptStore, OneTimeTokenStore, RefreshTokenStore, StoreError,
};
use crate::models::{
    FailureWindow, LoginAttempt, Membership, NewOneTimeToken, NewRefreshToken, NewTenant, NewUser,
    OneTimePurpose, OneTimeTokenRecord, RefreshTokenRecord, Role, RotateOutcome, Tenant,
    TenantAccess, TenantId, TenantStatus, User, UserCredentials,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, UserCredentials>,
    user_ids_by_email: HashMap<String, Uuid>,
    tenants: HashMap<TenantId, Tenant>,
    memberships: Vec<Membership>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    login_attempts: Vec<LoginAttempt>,
    one_time_tokens: HashMap<String, OneTimeTokenRecord>,
}

impl MemoryState {
    fn insert_tenant(&mut self, tenant: NewTenant) -> Tenant {
        let tenant = Tenant {
            id: TenantId::generate(),
            name: tenant.name,
            status: TenantStatus::Trial,
            created_at: Utc::now(),
        };
        self.tenants.insert(tenant.id, tenant.clone());
        tenant
    }

    fn insert_membership(&mut self, user_id: Uuid, tenant_id: TenantId, role: Role) -> Membership {
        let membership = Membership {
            user_id,
            tenant_id,
            role,
            is_active: true,
            created_at: Utc::now(),
        };
        self.memberships.push(membership.clone());
        membership
    }

    fn user_mut(&mut self, user_id: Uuid) -> Result<&mut UserCredentials, StoreError> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }

    fn revoke_user_tokens(&mut self, user_id: Uuid) -> u64 {
        let mut revoked = 0;
        for token in self
            .refresh_tokens
            .values_mut()
            .filter(|t| t.user_id == user_id && !t.revoked)
        {
            token.revoked = true;
            revoked += 1;
        }
        revoked
    }
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn register_owner(
        &self,
        user: NewUser,
        tenant: NewTenant,
    ) -> Result<(User, Tenant, Membership), StoreError> {
        let mut state = self.state.lock().await;
        if state.user_ids_by_email.contains_key(&user.email) {
            return Err(StoreError::Conflict("email already registered".into()));
        }

        let record = User {
            id: Uuid::now_v7(),
            email: user.email.clone(),
            is_active: true,
            email_verified: false,
            created_at: Utc::now(),
        };
        state.user_ids_by_email.insert(user.email, record.id);
        state.users.insert(
            record.id,
            UserCredentials {
                user: record.clone(),
                password_hash: user.password_hash,
            },
        );

        let tenant = state.insert_tenant(tenant);
        let membership = state.insert_membership(record.id, tenant.id, Role::Owner);
        Ok((record, tenant, membership))
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .user_ids_by_email
            .get(email)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserCredentials>, StoreError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.user_mut(user_id)?.user.email_verified = true;
        Ok(())
    }

    async fn replace_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.user_mut(user_id)?.password_hash = password_hash.to_string();
        Ok(state.revoke_user_tokens(user_id))
    }

    async fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        Ok(self.state.lock().await.insert_tenant(tenant))
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.state.lock().await.tenants.get(&tenant_id).cloned())
    }

    async fn set_tenant_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let tenant = state
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.status = status;
        Ok(())
    }

    async fn add_membership(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        role: Role,
    ) -> Result<Membership, StoreError> {
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        if !state.tenants.contains_key(&tenant_id) {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        }
        if state
            .memberships
            .iter()
            .any(|m| m.user_id == user_id && m.tenant_id == tenant_id)
        {
            return Err(StoreError::Conflict("membership already exists".into()));
        }
        Ok(state.insert_membership(user_id, tenant_id, role))
    }

    async fn set_membership_active(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let membership = state
            .memberships
            .iter_mut()
            .find(|m| m.user_id == user_id && m.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::NotFound("membership".into()))?;
        membership.is_active = active;
        Ok(())
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
    ) -> Result<Option<Membership>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .memberships
            .iter()
            .find(|m| m.user_id == user_id && m.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_tenant_access(&self, user_id: Uuid) -> Result<Vec<TenantAccess>, StoreError> {
        let state = self.state.lock().await;
        let mut access: Vec<(DateTime<Utc>, TenantAccess)> = state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| {
                state.tenants.get(&m.tenant_id).map(|tenant| {
                    (
                        m.created_at,
                        TenantAccess {
                            tenant: tenant.clone(),
                            role: m.role,
                            membership_active: m.is_active,
                        },
                    )
                })
            })
            .collect();
        access.sort_by_key(|(created_at, _)| *created_at);
        Ok(access.into_iter().map(|(_, a)| a).collect())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn store_refresh_token(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshTokenRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state.refresh_tokens.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("refresh token hash collision".into()));
        }
        let record = RefreshTokenRecord {
            id: Uuid::now_v7(),
            user_id: token.user_id,
            tenant_id: token.tenant_id,
            family_id: token.family_id,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            revoked: false,
            created_at: Utc::now(),
        };
        state
            .refresh_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(record)
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self.state.lock().await.refresh_tokens.get(token_hash).cloned())
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor_hash: &str,
        successor_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(presented) = state.refresh_tokens.get(presented_hash).cloned() else {
            return Ok(RotateOutcome::NotFound);
        };

        if presented.revoked {
            for token in state.refresh_tokens.values_mut() {
                if token.family_id == presented.family_id {
                    token.revoked = true;
                }
            }
            return Ok(RotateOutcome::ReuseDetected {
                family_id: presented.family_id,
                user_id: presented.user_id,
            });
        }

        if presented.expires_at <= now {
            return Ok(RotateOutcome::Expired);
        }

        if state.refresh_tokens.contains_key(successor_hash) {
            return Err(StoreError::Conflict("refresh token hash collision".into()));
        }

        let mut previous = presented;
        previous.revoked = true;
        state
            .refresh_tokens
            .insert(previous.token_hash.clone(), previous.clone());

        let successor = RefreshTokenRecord {
            id: Uuid::now_v7(),
            user_id: previous.user_id,
            tenant_id: previous.tenant_id,
            family_id: previous.family_id,
            token_hash: successor_hash.to_string(),
            expires_at: successor_expires_at,
            revoked: false,
            created_at: now,
        };
        state
            .refresh_tokens
            .insert(successor.token_hash.clone(), successor.clone());

        Ok(RotateOutcome::Rotated {
            previous,
            successor,
        })
    }

    async fn revoke_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let mut state = self.state.lock().await;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_refresh_family(&self, family_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut revoked = 0;
        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.family_id == family_id && !t.revoked)
        {
            token.revoked = true;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.revoke_user_tokens(user_id))
    }
}

#[async_trait]
impl LoginAttemptStore for MemoryStore {
    async fn record_login_attempt(&self, attempt: LoginAttempt) -> Result<(), StoreError> {
        self.state.lock().await.login_attempts.push(attempt);
        Ok(())
    }

    async fn failed_attempts_since(
        &self,
        email: &str,
        origin: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError> {
        let state = self.state.lock().await;
        let window = state
            .login_attempts
            .iter()
            .filter(|a| !a.success && a.attempted_at >= since)
            .filter(|a| a.email == email || a.origin == origin)
            .fold(FailureWindow::default(), |mut acc, a| {
                acc.count += 1;
                acc.last_failed_at = acc.last_failed_at.max(Some(a.attempted_at));
                acc
            });
        Ok(window)
    }

    async fn prune_login_attempts(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.login_attempts.len();
        state.login_attempts.retain(|a| a.attempted_at >= cutoff);
        Ok((before - state.login_attempts.len()) as u64)
    }
}

#[async_trait]
impl OneTimeTokenStore for MemoryStore {
    async fn store_one_time_token(
        &self,
        token: NewOneTimeToken,
    ) -> Result<OneTimeTokenRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state.one_time_tokens.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("one-time token hash collision".into()));
        }
        let record = OneTimeTokenRecord {
            id: Uuid::now_v7(),
            user_id: token.user_id,
            purpose: token.purpose,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            used: false,
            created_at: Utc::now(),
        };
        state
            .one_time_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(record)
    }

    async fn consume_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OneTimeTokenRecord>, StoreError> {
        let mut state = self.state.lock().await;
        match state.one_time_tokens.get_mut(token_hash) {
            Some(token) if token.purpose == purpose && !token.used && token.expires_at > now => {
                token.used = true;
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn invalidate_one_time_tokens(
        &self,
        user_id: Uuid,
        purpose: OneTimePurpose,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut invalidated = 0;
        for token in state
            .one_time_tokens
            .values_mut()
            .filter(|t| t.user_id == user_id && t.purpose == purpose && !t.used)
        {
            token.used = true;
            invalidated += 1;
        }
        Ok(invalidated)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password_hash: "$argon2id$stub".to_string(),
        }
    }

    fn new_tenant(name: &str) -> NewTenant {
        NewTenant {
            name: name.to_string(),
        }
    }

    async fn seeded_refresh_token(store: &MemoryStore, hash: &str) -> RefreshTokenRecord {
        let (user, tenant, _) = store
            .register_owner(new_user("a@x.com"), new_tenant("Acme"))
            .await
            .unwrap();
        store
            .store_refresh_token(NewRefreshToken {
                user_id: user.id,
                tenant_id: tenant.id,
                family_id: Uuid::now_v7(),
                token_hash: hash.to_string(),
                expires_at: Utc::now() + Duration::days(1),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = MemoryStore::new();
        store
            .register_owner(new_user("a@x.com"), new_tenant("Acme"))
            .await
            .unwrap();
        let err = store
            .register_owner(new_user("a@x.com"), new_tenant("Other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_owner_creates_owner_membership_in_trial_tenant() {
        let store = MemoryStore::new();
        let (user, tenant, membership) = store
            .register_owner(new_user("a@x.com"), new_tenant("Acme"))
            .await
            .unwrap();
        assert_eq!(membership.role, Role::Owner);
        assert_eq!(membership.user_id, user.id);
        assert_eq!(tenant.status, TenantStatus::Trial);
        assert!(!user.email_verified);

        let access = store.list_tenant_access(user.id).await.unwrap();
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].tenant.id, tenant.id);
    }

    #[tokio::test]
    async fn rotation_revokes_presented_and_keeps_family() {
        let store = MemoryStore::new();
        let original = seeded_refresh_token(&store, "h1").await;
        let now = Utc::now();

        let outcome = store
            .rotate_refresh_token("h1", "h2", now + Duration::days(1), now)
            .await
            .unwrap();
        let RotateOutcome::Rotated {
            previous,
            successor,
        } = outcome
        else {
            panic!("expected rotation, got {outcome:?}");
        };
        assert!(previous.revoked);
        assert!(!successor.revoked);
        assert_eq!(successor.family_id, original.family_id);
        assert_eq!(successor.tenant_id, original.tenant_id);
    }

    #[tokio::test]
    async fn presenting_a_revoked_token_revokes_the_family() {
        let store = MemoryStore::new();
        seeded_refresh_token(&store, "h1").await;
        let now = Utc::now();
        store
            .rotate_refresh_token("h1", "h2", now + Duration::days(1), now)
            .await
            .unwrap();

        let outcome = store
            .rotate_refresh_token("h1", "h3", now + Duration::days(1), now)
            .await
            .unwrap();
        assert!(matches!(outcome, RotateOutcome::ReuseDetected { .. }));

        let successor = store.find_refresh_token("h2").await.unwrap().unwrap();
        assert!(successor.revoked, "successor must be revoked with the family");
        assert!(store.find_refresh_token("h3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_token_is_not_rotated() {
        let store = MemoryStore::new();
        seeded_refresh_token(&store, "h1").await;
        let later = Utc::now() + Duration::days(2);
        let outcome = store
            .rotate_refresh_token("h1", "h2", later + Duration::days(1), later)
            .await
            .unwrap();
        assert!(matches!(outcome, RotateOutcome::Expired));
        assert!(!store.find_refresh_token("h1").await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn password_replacement_revokes_every_refresh_token() {
        let store = MemoryStore::new();
        let original = seeded_refresh_token(&store, "h1").await;
        let now = Utc::now();
        store
            .rotate_refresh_token("h1", "h2", now + Duration::days(1), now)
            .await
            .unwrap();

        let revoked = store
            .replace_password_hash(original.user_id, "$argon2id$new")
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(store.find_refresh_token("h2").await.unwrap().unwrap().revoked);
        let user = store.get_user(original.user_id).await.unwrap().unwrap();
        assert_eq!(user.password_hash, "$argon2id$new");

        let err = store
            .replace_password_hash(Uuid::now_v7(), "$argon2id$new")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn revoking_twice_reports_only_the_first() {
        let store = MemoryStore::new();
        seeded_refresh_token(&store, "h1").await;
        assert!(store.revoke_refresh_token("h1").await.unwrap().is_some());
        assert!(store.revoke_refresh_token("h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures_match_on_email_or_origin() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (email, origin, success) in [
            ("a@x.com", "10.0.0.1", false),
            ("a@x.com", "10.0.0.2", false),
            ("b@x.com", "10.0.0.1", false),
            ("c@x.com", "10.0.0.9", false),
            ("a@x.com", "10.0.0.1", true),
        ] {
            store
                .record_login_attempt(LoginAttempt {
                    email: email.into(),
                    origin: origin.into(),
                    success,
                    attempted_at: now,
                })
                .await
                .unwrap();
        }

        let window = store
            .failed_attempts_since("a@x.com", "10.0.0.1", now - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(window.count, 3);
        assert_eq!(window.last_failed_at, Some(now));
    }

    #[tokio::test]
    async fn one_time_token_is_consumed_once() {
        let store = MemoryStore::new();
        let (user, _, _) = store
            .register_owner(new_user("a@x.com"), new_tenant("Acme"))
            .await
            .unwrap();
        let now = Utc::now();
        store
            .store_one_time_token(NewOneTimeToken {
                user_id: user.id,
                purpose: OneTimePurpose::PasswordReset,
                token_hash: "t1".into(),
                expires_at: now + Duration::hours(1),
            })
            .await
            .unwrap();

        let wrong_purpose = store
            .consume_one_time_token(OneTimePurpose::EmailVerification, "t1", now)
            .await
            .unwrap();
        assert!(wrong_purpose.is_none());

        let first = store
            .consume_one_time_token(OneTimePurpose::PasswordReset, "t1", now)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .consume_one_time_token(OneTimePurpose::PasswordReset, "t1", now)
            .await
            .unwrap();
        assert!(second.is_none());
    }
}
