//! Password policy and Argon2id hashing.
//!
//! Hashing is deliberately expensive. The async wrappers move the work onto
//! tokio's blocking pool so it never stalls request handling.

use std::sync::{Arc, OnceLock};

use argon2::password_hash::{
    PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};
use tracing::error;

use super::AuthError;
use super::config::HashingParams;

/// Length and character-class rules for new passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
        }
    }
}

impl PasswordPolicy {
    /// Require the length bounds plus an uppercase letter, a lowercase letter and a digit.
    pub fn validate(&self, password: &str) -> Result<(), AuthError> {
        let len = password.chars().count();
        if len < self.min_length {
            return Err(AuthError::Validation(format!(
                "password must be at least {} characters",
                self.min_length
            )));
        }
        if len > self.max_length {
            return Err(AuthError::Validation(format!(
                "password must be at most {} characters",
                self.max_length
            )));
        }
        let upper = password.chars().any(char::is_uppercase);
        let lower = password.chars().any(char::is_lowercase);
        let digit = password.chars().any(|c| c.is_ascii_digit());
        if !(upper && lower && digit) {
            return Err(AuthError::Validation(
                "password must contain an uppercase letter, a lowercase letter and a digit".into(),
            ));
        }
        Ok(())
    }
}

/// Argon2id hasher with fixed cost parameters.
#[derive(Clone)]
pub struct PasswordHasher {
    inner: Arc<Inner>,
}

struct Inner {
    params: Params,
    dummy_hash: OnceLock<String>,
}

impl PasswordHasher {
    pub fn new(params: HashingParams) -> Result<Self, AuthError> {
        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            None,
        )
        .map_err(|e| AuthError::Internal(format!("argon2 params: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                params,
                dummy_hash: OnceLock::new(),
            }),
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.inner.params.clone())
    }

    /// Hash a password into a PHC string (`$argon2id$v=19$...`).
    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let salt_bytes: [u8; 16] = rand::random();
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| AuthError::Internal(format!("argon2 salt: {e}")))?;
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AuthError::Internal(format!("argon2 hash: {e}")))
    }

    /// Verify a password against a PHC hash. The comparison is constant time.
    ///
    /// `Ok(false)` on mismatch; `Err` only for a malformed stored hash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthError::Internal(format!("stored hash is malformed: {e}")))?;
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Internal(format!("argon2 verify: {e}"))),
        }
    }

    /// Spend one verification's worth of work on a throwaway hash, so an
    /// unknown email costs the same as a wrong password.
    pub fn verify_dummy(&self, password: &str) -> Result<(), AuthError> {
        let hash = match self.inner.dummy_hash.get() {
            Some(hash) => hash.clone(),
            None => {
                let hash = self.hash("tally-dummy-password")?;
                let _ = self.inner.dummy_hash.set(hash.clone());
                hash
            }
        };
        self.verify(password, &hash).map(|_| ())
    }

    pub async fn hash_blocking(&self, password: String) -> Result<String, AuthError> {
        let hasher = self.clone();
        run_blocking(move || hasher.hash(&password)).await
    }

    pub async fn verify_blocking(&self, password: String, hash: String) -> Result<bool, AuthError> {
        let hasher = self.clone();
        run_blocking(move || hasher.verify(&password, &hash)).await
    }

    pub async fn verify_dummy_blocking(&self, password: String) -> Result<(), AuthError> {
        let hasher = self.clone();
        run_blocking(move || hasher.verify_dummy(&password)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!(error = %e, "password hashing task failed");
        AuthError::Internal("password hashing task failed".into())
    })?
}
