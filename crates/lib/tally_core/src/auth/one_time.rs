//! Single-use password reset and email verification tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::AuthError;
use super::config::ttl;
use super::secrets::{generate_secret, sha256_hex};
use crate::models::{NewOneTimeToken, OneTimePurpose, OneTimeTokenRecord};
use crate::store::OneTimeTokenStore;

/// A freshly issued token. `token` is the only copy of the raw secret.
#[derive(Clone)]
pub struct IssuedOneTimeToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and consumes single-use tokens. Only digests are persisted.
#[derive(Clone)]
pub struct OneTimeTokens {
    store: Arc<dyn OneTimeTokenStore>,
    password_reset_ttl_secs: u64,
    email_verification_ttl_secs: u64,
}

impl OneTimeTokens {
    pub fn new(
        store: Arc<dyn OneTimeTokenStore>,
        password_reset_ttl_secs: u64,
        email_verification_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            password_reset_ttl_secs,
            email_verification_ttl_secs,
        }
    }

    fn ttl_secs(&self, purpose: OneTimePurpose) -> u64 {
        match purpose {
            OneTimePurpose::PasswordReset => self.password_reset_ttl_secs,
            OneTimePurpose::EmailVerification => self.email_verification_ttl_secs,
        }
    }

    /// Issue a token, invalidating any earlier unused token of the same purpose.
    pub async fn issue(
        &self,
        user_id: Uuid,
        purpose: OneTimePurpose,
        now: DateTime<Utc>,
    ) -> Result<IssuedOneTimeToken, AuthError> {
        self.store
            .invalidate_one_time_tokens(user_id, purpose)
            .await?;
        let token = generate_secret();
        let expires_at = now + ttl(self.ttl_secs(purpose));
        self.store
            .store_one_time_token(NewOneTimeToken {
                user_id,
                purpose,
                token_hash: sha256_hex(&token),
                expires_at,
            })
            .await?;
        Ok(IssuedOneTimeToken { token, expires_at })
    }

    /// Spend a token. Unknown, used, expired and wrong-purpose tokens all fail
    /// the same way.
    pub async fn consume(
        &self,
        purpose: OneTimePurpose,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<OneTimeTokenRecord, AuthError> {
        self.store
            .consume_one_time_token(purpose, &sha256_hex(token), now)
            .await?
            .ok_or(AuthError::OneTimeTokenInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tokens() -> OneTimeTokens {
        OneTimeTokens::new(Arc::new(MemoryStore::new()), 3600, 86_400)
    }

    #[tokio::test]
    async fn token_is_consumed_exactly_once() {
        let t = tokens();
        let user = Uuid::now_v7();
        let now = Utc::now();
        let issued = t.issue(user, OneTimePurpose::PasswordReset, now).await.unwrap();

        let record = t
            .consume(OneTimePurpose::PasswordReset, &issued.token, now)
            .await
            .unwrap();
        assert_eq!(record.user_id, user);
        assert!(matches!(
            t.consume(OneTimePurpose::PasswordReset, &issued.token, now)
                .await,
            Err(AuthError::OneTimeTokenInvalid)
        ));
    }

    #[tokio::test]
    async fn expired_token_cannot_be_consumed() {
        let t = tokens();
        let now = Utc::now();
        let issued = t
            .issue(Uuid::now_v7(), OneTimePurpose::PasswordReset, now)
            .await
            .unwrap();
        let later = now + chrono::Duration::seconds(3601);
        assert!(
            t.consume(OneTimePurpose::PasswordReset, &issued.token, later)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn purpose_must_match() {
        let t = tokens();
        let now = Utc::now();
        let issued = t
            .issue(Uuid::now_v7(), OneTimePurpose::EmailVerification, now)
            .await
            .unwrap();
        assert_eq!(issued.expires_at, now + chrono::Duration::seconds(86_400));
        assert!(
            t.consume(OneTimePurpose::PasswordReset, &issued.token, now)
                .await
                .is_err()
        );
        assert!(
            t.consume(OneTimePurpose::EmailVerification, &issued.token, now)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn reissue_invalidates_earlier_token() {
        let t = tokens();
        let user = Uuid::now_v7();
        let now = Utc::now();
        let first = t.issue(user, OneTimePurpose::PasswordReset, now).await.unwrap();
        let second = t.issue(user, OneTimePurpose::PasswordReset, now).await.unwrap();
        assert!(
            t.consume(OneTimePurpose::PasswordReset, &first.token, now)
                .await
                .is_err()
        );
        assert!(
            t.consume(OneTimePurpose::PasswordReset, &second.token, now)
                .await
                .is_ok()
        );
    }
}
