//! PostgreSQL store.
//!
//! Plain runtime queries with tuple rows. Rotation runs inside a transaction
//! that locks the presented row (`FOR UPDATE`), so two concurrent refreshes of
//! the same token serialise: the second one sees a revoked row and takes the
//! reuse path. A transaction dropped before commit (e.g. on timeout) rolls back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    CredentialStore, LoginAttemptStore, OneTimeTokenStore, RefreshTokenStore, StoreError,
};
use crate::models::{
    FailureWindow, LoginAttempt, Membership, NewOneTimeToken, NewRefreshToken, NewTenant, NewUser,
    OneTimePurpose, OneTimeTokenRecord, RefreshTokenRecord, Role, RotateOutcome, Tenant,
    TenantAccess, TenantId, TenantStatus, User, UserCredentials,
};

type UserRow = (Uuid, String, String, bool, bool, DateTime<Utc>);
type TenantRow = (Uuid, String, String, DateTime<Utc>);
type MembershipRow = (Uuid, Uuid, String, bool, DateTime<Utc>);
type RefreshRow = (
    Uuid,
    Uuid,
    Uuid,
    Uuid,
    String,
    DateTime<Utc>,
    bool,
    DateTime<Utc>,
);
type OneTimeRow = (Uuid, Uuid, String, String, DateTime<Utc>, bool, DateTime<Utc>);

const USER_COLUMNS: &str = "id, email, password_hash, is_active, email_verified, created_at";
const REFRESH_COLUMNS: &str =
    "id, user_id, tenant_id, family_id, token_hash, expires_at, revoked, created_at";
const ONE_TIME_COLUMNS: &str = "id, user_id, purpose, token_hash, expires_at, used, created_at";

fn user_from_row(row: UserRow) -> UserCredentials {
    let (id, email, password_hash, is_active, email_verified, created_at) = row;
    UserCredentials {
        user: User {
            id,
            email,
            is_active,
            email_verified,
            created_at,
        },
        password_hash,
    }
}

fn tenant_from_row(row: TenantRow) -> Result<Tenant, StoreError> {
    let (id, name, status, created_at) = row;
    Ok(Tenant {
        id: TenantId::new(id),
        name,
        status: status.parse().map_err(StoreError::Corrupt)?,
        created_at,
    })
}

fn membership_from_row(row: MembershipRow) -> Result<Membership, StoreError> {
    let (user_id, tenant_id, role, is_active, created_at) = row;
    Ok(Membership {
        user_id,
        tenant_id: TenantId::new(tenant_id),
        role: role.parse().map_err(StoreError::Corrupt)?,
        is_active,
        created_at,
    })
}

fn refresh_from_row(row: RefreshRow) -> RefreshTokenRecord {
    let (id, user_id, tenant_id, family_id, token_hash, expires_at, revoked, created_at) = row;
    RefreshTokenRecord {
        id,
        user_id,
        tenant_id: TenantId::new(tenant_id),
        family_id,
        token_hash,
        expires_at,
        revoked,
        created_at,
    }
}

fn one_time_from_row(row: OneTimeRow) -> Result<OneTimeTokenRecord, StoreError> {
    let (id, user_id, purpose, token_hash, expires_at, used, created_at) = row;
    Ok(OneTimeTokenRecord {
        id,
        user_id,
        purpose: purpose.parse().map_err(StoreError::Corrupt)?,
        token_hash,
        expires_at,
        used,
        created_at,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded migrations in `tally_core/migrations/`.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn register_owner(
        &self,
        user: NewUser,
        tenant: NewTenant,
    ) -> Result<(User, Tenant, Membership), StoreError> {
        let mut tx = self.pool.begin().await?;

        let user_row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (id, email, password_hash) VALUES ($1, $2, $3) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(&user.email)
        .bind(&user.password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict("email already registered".into())
            } else {
                StoreError::Db(e)
            }
        })?;
        let user = user_from_row(user_row).user;

        let tenant_row = sqlx::query_as::<_, TenantRow>(
            "INSERT INTO tenants (id, name) VALUES ($1, $2) \
             RETURNING id, name, status, created_at",
        )
        .bind(TenantId::generate().as_uuid())
        .bind(&tenant.name)
        .fetch_one(&mut *tx)
        .await?;
        let tenant = tenant_from_row(tenant_row)?;

        let membership_row = sqlx::query_as::<_, MembershipRow>(
            "INSERT INTO tenant_memberships (user_id, tenant_id, role) VALUES ($1, $2, $3) \
             RETURNING user_id, tenant_id, role, is_active, created_at",
        )
        .bind(user.id)
        .bind(tenant.id.as_uuid())
        .bind(Role::Owner.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let membership = membership_from_row(membership_row)?;

        tx.commit().await?;
        Ok((user, tenant, membership))
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserCredentials>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn mark_email_verified(&self, user_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET email_verified = TRUE, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    async fn replace_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Rotation holds FOR SHARE on this row, so no successor can be
        // inserted between the update below and commit.
        let locked = sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }

        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(&mut *tx)
            .await?;

        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE user_id = $1 AND NOT revoked",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(revoked.rows_affected())
    }

    async fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant, StoreError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "INSERT INTO tenants (id, name) VALUES ($1, $2) \
             RETURNING id, name, status, created_at",
        )
        .bind(TenantId::generate().as_uuid())
        .bind(&tenant.name)
        .fetch_one(&self.pool)
        .await?;
        tenant_from_row(row)
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT id, name, status, created_at FROM tenants WHERE id = $1",
        )
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(tenant_from_row).transpose()
    }

    async fn set_tenant_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tenants SET status = $2 WHERE id = $1")
            .bind(tenant_id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {tenant_id}")));
        }
        Ok(())
    }

    async fn add_membership(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        role: Role,
    ) -> Result<Membership, StoreError> {
        let row = sqlx::query_as::<_, MembershipRow>(
            "INSERT INTO tenant_memberships (user_id, tenant_id, role) VALUES ($1, $2, $3) \
             RETURNING user_id, tenant_id, role, is_active, created_at",
        )
        .bind(user_id)
        .bind(tenant_id.as_uuid())
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict("membership already exists".into())
            } else {
                StoreError::Db(e)
            }
        })?;
        membership_from_row(row)
    }

    async fn set_membership_active(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
        active: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tenant_memberships SET is_active = $3 WHERE user_id = $1 AND tenant_id = $2",
        )
        .bind(user_id)
        .bind(tenant_id.as_uuid())
        .bind(active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("membership".into()));
        }
        Ok(())
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
    ) -> Result<Option<Membership>, StoreError> {
        let row = sqlx::query_as::<_, MembershipRow>(
            "SELECT user_id, tenant_id, role, is_active, created_at \
             FROM tenant_memberships WHERE user_id = $1 AND tenant_id = $2",
        )
        .bind(user_id)
        .bind(tenant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(membership_from_row).transpose()
    }

    async fn list_tenant_access(&self, user_id: Uuid) -> Result<Vec<TenantAccess>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, String, String, DateTime<Utc>, String, bool)>(
            "SELECT t.id, t.name, t.status, t.created_at, m.role, m.is_active \
             FROM tenant_memberships m \
             JOIN tenants t ON t.id = m.tenant_id \
             WHERE m.user_id = $1 \
             ORDER BY m.created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, name, status, created_at, role, is_active)| {
                Ok(TenantAccess {
                    tenant: tenant_from_row((id, name, status, created_at))?,
                    role: role.parse().map_err(StoreError::Corrupt)?,
                    membership_active: is_active,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RefreshTokenStore for PgStore {
    async fn store_refresh_token(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshTokenRecord, StoreError> {
        let row = sqlx::query_as::<_, RefreshRow>(&format!(
            "INSERT INTO refresh_tokens (id, user_id, tenant_id, family_id, token_hash, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {REFRESH_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(token.user_id)
        .bind(token.tenant_id.as_uuid())
        .bind(token.family_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(refresh_from_row(row))
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, RefreshRow>(&format!(
            "SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(refresh_from_row))
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        successor_hash: &str,
        successor_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // User row first, then token row: the same order a password change
        // takes its locks in.
        sqlx::query(
            "SELECT u.id FROM users u JOIN refresh_tokens r ON r.user_id = u.id \
             WHERE r.token_hash = $1 FOR SHARE OF u",
        )
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let presented = sqlx::query_as::<_, RefreshRow>(&format!(
            "SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE"
        ))
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await?
        .map(refresh_from_row);

        let Some(presented) = presented else {
            return Ok(RotateOutcome::NotFound);
        };

        if presented.revoked {
            sqlx::query(
                "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
                 WHERE family_id = $1 AND NOT revoked",
            )
            .bind(presented.family_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(RotateOutcome::ReuseDetected {
                family_id: presented.family_id,
                user_id: presented.user_id,
            });
        }

        if presented.expires_at <= now {
            return Ok(RotateOutcome::Expired);
        }

        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE id = $1 AND NOT revoked",
        )
        .bind(presented.id)
        .execute(&mut *tx)
        .await?;
        if revoked.rows_affected() != 1 {
            // Unreachable while the row lock is held; treat as a lost race.
            return Ok(RotateOutcome::ReuseDetected {
                family_id: presented.family_id,
                user_id: presented.user_id,
            });
        }

        let successor = sqlx::query_as::<_, RefreshRow>(&format!(
            "INSERT INTO refresh_tokens \
             (id, user_id, tenant_id, family_id, token_hash, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {REFRESH_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(presented.user_id)
        .bind(presented.tenant_id.as_uuid())
        .bind(presented.family_id)
        .bind(successor_hash)
        .bind(successor_expires_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut previous = presented;
        previous.revoked = true;
        Ok(RotateOutcome::Rotated {
            previous,
            successor: refresh_from_row(successor),
        })
    }

    async fn revoke_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, RefreshRow>(&format!(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE token_hash = $1 AND NOT revoked \
             RETURNING {REFRESH_COLUMNS}"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(refresh_from_row))
    }

    async fn revoke_refresh_family(&self, family_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE family_id = $1 AND NOT revoked",
        )
        .bind(family_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE user_id = $1 AND NOT revoked",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LoginAttemptStore for PgStore {
    async fn record_login_attempt(&self, attempt: LoginAttempt) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO login_attempts (email, origin, success, attempted_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&attempt.email)
        .bind(&attempt.origin)
        .bind(attempt.success)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failed_attempts_since(
        &self,
        email: &str,
        origin: &str,
        since: DateTime<Utc>,
    ) -> Result<FailureWindow, StoreError> {
        let (count, last_failed_at) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            "SELECT COUNT(*), MAX(attempted_at) FROM login_attempts \
             WHERE NOT success AND attempted_at >= $3 \
               AND (email = $1 OR origin = $2)",
        )
        .bind(email)
        .bind(origin)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(FailureWindow {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            last_failed_at,
        })
    }

    async fn prune_login_attempts(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE attempted_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OneTimeTokenStore for PgStore {
    async fn store_one_time_token(
        &self,
        token: NewOneTimeToken,
    ) -> Result<OneTimeTokenRecord, StoreError> {
        let row = sqlx::query_as::<_, OneTimeRow>(&format!(
            "INSERT INTO one_time_tokens (id, user_id, purpose, token_hash, expires_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {ONE_TIME_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(token.user_id)
        .bind(token.purpose.as_str())
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .fetch_one(&self.pool)
        .await?;
        one_time_from_row(row)
    }

    async fn consume_one_time_token(
        &self,
        purpose: OneTimePurpose,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OneTimeTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, OneTimeRow>(&format!(
            "UPDATE one_time_tokens SET used = TRUE, used_at = $3 \
             WHERE token_hash = $1 AND purpose = $2 AND NOT used AND expires_at > $3 \
             RETURNING {ONE_TIME_COLUMNS}"
        ))
        .bind(token_hash)
        .bind(purpose.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(one_time_from_row).transpose()
    }

    async fn invalidate_one_time_tokens(
        &self,
        user_id: Uuid,
        purpose: OneTimePurpose,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE one_time_tokens SET used = TRUE, used_at = now() \
             WHERE user_id = $1 AND purpose = $2 AND NOT used",
        )
        .bind(user_id)
        .bind(purpose.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
