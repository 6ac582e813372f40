//! Authentication service: the public credential flows composed from
//! `tally_core::auth` primitives and the stores.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::auth::AuthError;
use tally_core::auth::config::AuthConfig;
use tally_core::auth::csrf::generate_csrf_token;
use tally_core::auth::jwt::{AccessClaims, TokenCodec};
use tally_core::auth::ledger::RefreshLedger;
use tally_core::auth::lockout::BruteForceGuard;
use tally_core::auth::notify::{Notification, Notifier};
use tally_core::auth::one_time::OneTimeTokens;
use tally_core::auth::password::PasswordHasher;
use tally_core::models::{
    Membership, NewTenant, NewUser, OneTimePurpose, RefreshTokenRecord, Role, Tenant, TenantAccess,
    TenantId, User,
};
use tally_core::store::{StoreError, Stores, normalize_email};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a successful login or refresh hands back to the client.
pub struct SessionTokens {
    pub access_token: String,
    pub claims: AccessClaims,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub csrf_token: String,
    pub user: User,
    pub tenant: Tenant,
    pub role: Role,
}

/// A tenant-scoped access token minted without touching the refresh chain.
pub struct AccessGrant {
    pub access_token: String,
    pub claims: AccessClaims,
    pub tenant: Tenant,
    pub role: Role,
}

pub struct Registration {
    pub user: User,
    pub tenant: Tenant,
    pub membership: Membership,
}

/// Caller identity as seen by `GET /auth/me`.
pub struct Identity {
    pub user: User,
    pub active: TenantAccess,
    pub tenants: Vec<TenantAccess>,
}

/// Auth orchestrator.
#[derive(Clone)]
pub struct AuthService {
    stores: Stores,
    config: Arc<AuthConfig>,
    hasher: PasswordHasher,
    codec: TokenCodec,
    ledger: RefreshLedger,
    guard: BruteForceGuard,
    one_time: OneTimeTokens,
    notifier: Arc<dyn Notifier>,
}

impl AuthService {
    pub fn new(
        stores: Stores,
        config: AuthConfig,
        jwt_secret: &[u8],
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AuthError> {
        Ok(Self {
            hasher: PasswordHasher::new(config.hashing)?,
            codec: TokenCodec::new(
                jwt_secret,
                config.jwt_issuer.clone(),
                config.access_token_ttl_secs,
            ),
            ledger: RefreshLedger::new(stores.refresh_tokens.clone(), config.refresh_token_ttl_secs),
            guard: BruteForceGuard::new(stores.login_attempts.clone(), config.lockout.clone()),
            one_time: OneTimeTokens::new(
                stores.one_time_tokens.clone(),
                config.password_reset_ttl_secs,
                config.email_verification_ttl_secs,
            ),
            stores,
            config: Arc::new(config),
            notifier,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn guard(&self) -> &BruteForceGuard {
        &self.guard
    }

    /// Store reachability, for health checks.
    pub async fn ping(&self) -> bool {
        self.stores.credentials.ping().await.is_ok()
    }

    /// Bound a store-heavy flow by the configured store budget. Dropping the
    /// inner future rolls back any open transaction.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, AuthError>>,
    ) -> Result<T, AuthError> {
        tokio::time::timeout(self.config.store_timeout(), fut)
            .await
            .map_err(|_| {
                error!(op, "auth operation timed out");
                AuthError::Timeout(op)
            })?
    }

    // -----------------------------------------------------------------------
    // Registration & email verification
    // -----------------------------------------------------------------------

    /// Create a user, a trial tenant owned by them, and send a verification token.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        tenant_name: Option<&str>,
    ) -> Result<Registration, AuthError> {
        let email = validate_email(email)?;
        self.config.password_policy.validate(password)?;

        let tenant_name = match tenant_name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("{}'s workspace", email.split('@').next().unwrap_or("new")),
        };

        let password_hash = self.hasher.hash_blocking(password.to_string()).await?;
        let (user, tenant, membership) = self
            .stores
            .credentials
            .register_owner(
                NewUser {
                    email: email.clone(),
                    password_hash,
                },
                NewTenant { name: tenant_name },
            )
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => AuthError::Conflict("email already registered".into()),
                other => AuthError::Store(other),
            })?;

        info!(user_id = %user.id, tenant_id = %tenant.id, "user registered");
        self.send_one_time(&user, OneTimePurpose::EmailVerification)
            .await?;

        Ok(Registration {
            user,
            tenant,
            membership,
        })
    }

    pub async fn verify_email(&self, token: &str) -> Result<(), AuthError> {
        let record = self
            .one_time
            .consume(OneTimePurpose::EmailVerification, token, Utc::now())
            .await?;
        self.stores
            .credentials
            .mark_email_verified(record.user_id)
            .await?;
        info!(user_id = %record.user_id, "email verified");
        Ok(())
    }

    /// Re-send a verification token. Reports success whether or not the
    /// email is registered.
    pub async fn resend_verification(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email);
        match self.stores.credentials.find_user_by_email(&email).await? {
            Some(creds) if creds.user.is_active && !creds.user.email_verified => {
                self.send_one_time(&creds.user, OneTimePurpose::EmailVerification)
                    .await
            }
            _ => {
                debug!("verification resend skipped");
                Ok(())
            }
        }
    }

    async fn send_one_time(&self, user: &User, purpose: OneTimePurpose) -> Result<(), AuthError> {
        let issued = self.one_time.issue(user.id, purpose, Utc::now()).await?;
        self.notifier
            .send(Notification {
                to_email: user.email.clone(),
                purpose,
                token: issued.token,
                expires_at: issued.expires_at,
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Login / refresh / logout
    // -----------------------------------------------------------------------

    /// Check the brute-force guard, verify the password and open a session.
    ///
    /// `tenant_id` selects which membership to activate; without it the
    /// oldest usable membership is used.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        origin: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<SessionTokens, AuthError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("email and password are required".into()));
        }
        self.bounded("login", self.login_inner(email, password, origin, tenant_id))
            .await
    }

    async fn login_inner(
        &self,
        email: String,
        password: &str,
        origin: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<SessionTokens, AuthError> {
        let now = Utc::now();
        if let Err(locked) = self.guard.check(&email, origin, now).await {
            self.guard.record(&email, origin, false, now).await?;
            return Err(locked);
        }

        let result = self.authenticate(&email, password, tenant_id).await;
        self.guard
            .record(&email, origin, result.is_ok(), now)
            .await?;
        let (user, access) = result?;

        let tokens = self.open_session(user, access, now).await?;
        info!(
            user_id = %tokens.user.id,
            tenant_id = %tokens.tenant.id,
            role = %tokens.role,
            "user logged in"
        );
        Ok(tokens)
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
        tenant_id: Option<TenantId>,
    ) -> Result<(User, TenantAccess), AuthError> {
        let Some(creds) = self.stores.credentials.find_user_by_email(email).await? else {
            if let Err(e) = self
                .hasher
                .verify_dummy_blocking(password.to_string())
                .await
            {
                error!(error = %e, "dummy password verification failed");
            }
            return Err(AuthError::InvalidCredentials);
        };

        let matches = self
            .hasher
            .verify_blocking(password.to_string(), creds.password_hash.clone())
            .await
            .unwrap_or_else(|e| {
                error!(user_id = %creds.user.id, error = %e, "password verification failed");
                false
            });
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }
        if !creds.user.is_active {
            return Err(AuthError::AccountDisabled);
        }
        if !creds.user.email_verified {
            return Err(AuthError::EmailNotVerified);
        }

        let tenants = self
            .stores
            .credentials
            .list_tenant_access(creds.user.id)
            .await?;
        let access = match tenant_id {
            Some(wanted) => tenants
                .into_iter()
                .find(|a| a.tenant.id == wanted)
                .filter(TenantAccess::is_usable)
                .ok_or_else(|| {
                    AuthError::TenantAccessDenied(format!("no active access to tenant {wanted}"))
                })?,
            None => tenants
                .into_iter()
                .find(TenantAccess::is_usable)
                .ok_or_else(|| AuthError::TenantAccessDenied("no active tenant".into()))?,
        };
        Ok((creds.user, access))
    }

    async fn open_session(
        &self,
        user: User,
        access: TenantAccess,
        now: DateTime<Utc>,
    ) -> Result<SessionTokens, AuthError> {
        let (access_token, claims) =
            self.codec
                .issue(user.id, &user.email, access.tenant.id, access.role, now)?;
        let refresh = self.ledger.issue(user.id, access.tenant.id, now).await?;
        Ok(SessionTokens {
            access_token,
            claims,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.record.expires_at,
            csrf_token: generate_csrf_token(),
            user,
            tenant: access.tenant,
            role: access.role,
        })
    }

    /// Rotate a refresh token and mint a new access token for the tenant the
    /// chain was issued for.
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, AuthError> {
        if refresh_token.is_empty() {
            return Err(AuthError::RefreshTokenInvalid);
        }
        self.bounded("refresh", self.refresh_inner(refresh_token))
            .await
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<SessionTokens, AuthError> {
        let now = Utc::now();
        let rotated = self
            .ledger
            .rotate(refresh_token, now)
            .await
            .map_err(|e| match e {
                AuthError::Store(inner) => {
                    error!(error = %inner, "refresh rotation failed");
                    AuthError::RefreshTokenInvalid
                }
                other => other,
            })?;
        let record = rotated.record;

        let user = match self.stores.credentials.get_user(record.user_id).await? {
            Some(creds) if creds.user.is_active => creds.user,
            _ => return Err(self.deny_refresh(&record, AuthError::AccountDisabled).await),
        };
        let access = match self.tenant_access(user.id, record.tenant_id).await {
            Ok(access) => access,
            Err(e) => return Err(self.deny_refresh(&record, e).await),
        };

        let (access_token, claims) =
            self.codec
                .issue(user.id, &user.email, access.tenant.id, access.role, now)?;
        debug!(user_id = %user.id, family_id = %record.family_id, "refresh token rotated");
        Ok(SessionTokens {
            access_token,
            claims,
            refresh_token: rotated.token,
            refresh_expires_at: record.expires_at,
            csrf_token: generate_csrf_token(),
            user,
            tenant: access.tenant,
            role: access.role,
        })
    }

    /// Revoke the whole chain of a token whose owner may no longer use it.
    async fn deny_refresh(&self, record: &RefreshTokenRecord, reason: AuthError) -> AuthError {
        if let Err(e) = self.ledger.revoke_family(record.family_id).await {
            return e;
        }
        warn!(
            user_id = %record.user_id,
            family_id = %record.family_id,
            error = %reason,
            "refresh denied; chain revoked"
        );
        reason
    }

    /// Revoke the presented refresh token, if it belongs to the caller.
    pub async fn logout(&self, user_id: Uuid, refresh_token: Option<&str>) -> Result<(), AuthError> {
        let Some(token) = refresh_token.filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        match self.ledger.find(token).await? {
            Some(record) if record.user_id != user_id => {
                warn!(%user_id, owner = %record.user_id, "logout presented another user's refresh token");
                return Ok(());
            }
            Some(record) if !record.revoked => {}
            _ => {
                debug!(%user_id, "logout with inactive refresh token");
                return Ok(());
            }
        }
        if let Some(record) = self.ledger.revoke(token).await? {
            info!(%user_id, family_id = %record.family_id, "user logged out");
        }
        Ok(())
    }

    /// Revoke every refresh token of the user.
    pub async fn logout_all(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.ledger.revoke_all(user_id).await?;
        info!(%user_id, revoked, "user logged out everywhere");
        Ok(revoked)
    }

    // -----------------------------------------------------------------------
    // Passwords
    // -----------------------------------------------------------------------

    /// Issue a reset token. Reports success whether or not the email exists.
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        let email = normalize_email(email);
        match self.stores.credentials.find_user_by_email(&email).await? {
            Some(creds) if creds.user.is_active => {
                self.send_one_time(&creds.user, OneTimePurpose::PasswordReset)
                    .await
            }
            _ => {
                debug!("password reset skipped");
                Ok(())
            }
        }
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), AuthError> {
        self.config.password_policy.validate(new_password)?;
        self.bounded("reset_password", async {
            let record = self
                .one_time
                .consume(OneTimePurpose::PasswordReset, token, Utc::now())
                .await?;
            let creds = self
                .stores
                .credentials
                .get_user(record.user_id)
                .await?
                .ok_or(AuthError::OneTimeTokenInvalid)?;
            self.replace_password(&creds.user, new_password).await?;
            if !creds.user.email_verified {
                // Receiving the reset email proves ownership of the address.
                self.stores
                    .credentials
                    .mark_email_verified(creds.user.id)
                    .await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let creds = self
            .stores
            .credentials
            .get_user(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let matches = self
            .hasher
            .verify_blocking(current_password.to_string(), creds.password_hash.clone())
            .await
            .unwrap_or_else(|e| {
                error!(%user_id, error = %e, "password verification failed");
                false
            });
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }
        self.config.password_policy.validate(new_password)?;
        self.replace_password(&creds.user, new_password).await
    }

    /// Store a new hash and revoke every refresh token in one store call, then
    /// drop outstanding reset tokens.
    async fn replace_password(&self, user: &User, new_password: &str) -> Result<(), AuthError> {
        let hash = self.hasher.hash_blocking(new_password.to_string()).await?;
        let revoked = self
            .stores
            .credentials
            .replace_password_hash(user.id, &hash)
            .await?;
        self.stores
            .one_time_tokens
            .invalidate_one_time_tokens(user.id, OneTimePurpose::PasswordReset)
            .await?;
        info!(user_id = %user.id, revoked, "password changed; sessions revoked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tenants
    // -----------------------------------------------------------------------

    async fn tenant_access(
        &self,
        user_id: Uuid,
        tenant_id: TenantId,
    ) -> Result<TenantAccess, AuthError> {
        let membership = self
            .stores
            .credentials
            .find_membership(user_id, tenant_id)
            .await?
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                AuthError::TenantAccessDenied(format!("no active membership in tenant {tenant_id}"))
            })?;
        let tenant = self
            .stores
            .credentials
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| AuthError::TenantAccessDenied(format!("tenant {tenant_id} not found")))?;
        if !tenant.status.permits_access() {
            return Err(AuthError::TenantAccessDenied(format!(
                "tenant {tenant_id} is {}",
                tenant.status.as_str()
            )));
        }
        Ok(TenantAccess {
            tenant,
            role: membership.role,
            membership_active: membership.is_active,
        })
    }

    /// Mint an access token for another tenant the caller belongs to.
    pub async fn switch_tenant(
        &self,
        claims: &AccessClaims,
        tenant_id: TenantId,
    ) -> Result<AccessGrant, AuthError> {
        match self.stores.credentials.get_user(claims.sub).await? {
            Some(creds) if creds.user.is_active => {}
            _ => return Err(AuthError::AccountDisabled),
        }
        let access = self.tenant_access(claims.sub, tenant_id).await?;
        let (access_token, new_claims) = self.codec.issue(
            claims.sub,
            &claims.email,
            access.tenant.id,
            access.role,
            Utc::now(),
        )?;
        info!(user_id = %claims.sub, from = %claims.tid, to = %tenant_id, "tenant switched");
        Ok(AccessGrant {
            access_token,
            claims: new_claims,
            tenant: access.tenant,
            role: access.role,
        })
    }

    pub async fn me(&self, claims: &AccessClaims) -> Result<Identity, AuthError> {
        let user = self
            .stores
            .credentials
            .get_user(claims.sub)
            .await?
            .filter(|c| c.user.is_active)
            .ok_or(AuthError::AccountDisabled)?
            .user;
        let tenants = self.stores.credentials.list_tenant_access(user.id).await?;
        let active = tenants
            .iter()
            .find(|a| a.tenant.id == claims.tid)
            .filter(|a| a.is_usable())
            .cloned()
            .ok_or_else(|| {
                AuthError::TenantAccessDenied(format!("no active access to tenant {}", claims.tid))
            })?;
        Ok(Identity {
            user,
            active,
            tenants,
        })
    }
}

fn validate_email(email: &str) -> Result<String, AuthError> {
    let email = normalize_email(email);
    let valid = email.len() <= 254
        && !email.chars().any(char::is_whitespace)
        && email.split_once('@').is_some_and(|(local, domain)| {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        });
    if valid {
        Ok(email)
    } else {
        Err(AuthError::Validation("invalid email address".into()))
    }
}
