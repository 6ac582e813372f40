//! # tally_api
//!
//! HTTP API library for Tally.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use sqlx::PgPool;
use tally_core::auth::AuthError;
use tally_core::auth::notify::Notifier;
use tally_core::store::{MemoryStore, PgStore, Stores};
use tally_core::tenancy::{
    DataBackend, Database, MemoryBackend, PgBackend, business_schema,
};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{auth, health, records};
use crate::services::auth::AuthService;
use crate::services::rate_limit::RateLimiter;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// API configuration.
    pub config: Arc<ApiConfig>,
    /// Credential flows.
    pub auth: AuthService,
    /// Tenant data access; handlers get a per-request session from it.
    pub database: Database,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        stores: Stores,
        backend: Arc<dyn DataBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AuthError> {
        let auth = AuthService::new(
            stores,
            config.auth.clone(),
            config.jwt_secret.as_bytes(),
            notifier,
        )?;
        let database = Database::new(backend, business_schema(), config.isolation_mode);
        Ok(Self {
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            config: Arc::new(config),
            auth,
            database,
        })
    }

    /// State backed by in-process stores. Nothing survives a restart.
    pub fn in_memory(config: ApiConfig, notifier: Arc<dyn Notifier>) -> Result<Self, AuthError> {
        Self::new(
            config,
            Stores::from_shared(Arc::new(MemoryStore::new())),
            Arc::new(MemoryBackend::new()),
            notifier,
        )
    }

    /// State backed by PostgreSQL. Run [`migrate`] first.
    pub fn postgres(
        config: ApiConfig,
        pool: PgPool,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AuthError> {
        Self::new(
            config,
            Stores::from_shared(Arc::new(PgStore::new(pool.clone()))),
            Arc::new(PgBackend::new(pool)),
            notifier,
        )
    }
}

/// Run embedded database migrations.
///
/// Delegates to `tally_core`, which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    PgStore::new(pool.clone()).migrate().await
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public = Router::new()
        .route(routes::GET_API_HEALTH, get(health::health_handler))
        .route(routes::POST_AUTH_REGISTER, post(auth::register_handler))
        .route(routes::POST_AUTH_VERIFY_EMAIL, post(auth::verify_email_handler))
        .route(
            routes::POST_AUTH_RESEND_VERIFICATION,
            post(auth::resend_verification_handler),
        )
        .route(routes::POST_AUTH_LOGIN, post(auth::login_handler))
        .route(routes::POST_AUTH_REFRESH, post(auth::refresh_handler))
        .route(
            routes::POST_AUTH_FORGOT_PASSWORD,
            post(auth::forgot_password_handler),
        )
        .route(
            routes::POST_AUTH_RESET_PASSWORD,
            post(auth::reset_password_handler),
        );

    // Protected routes (access token, CSRF on writes, tenant session)
    let protected = Router::new()
        .route(routes::POST_AUTH_LOGOUT, post(auth::logout_handler))
        .route(routes::POST_AUTH_LOGOUT_ALL, post(auth::logout_all_handler))
        .route(
            routes::POST_AUTH_CHANGE_PASSWORD,
            post(auth::change_password_handler),
        )
        .route(
            routes::POST_AUTH_SWITCH_TENANT,
            post(auth::switch_tenant_handler),
        )
        .route(routes::GET_AUTH_ME, get(auth::me_handler))
        .route(
            routes::API_RECORDS_TABLE,
            get(records::list_records_handler).post(records::create_record_handler),
        )
        .route(
            routes::API_RECORDS_TABLE_ID,
            get(records::get_record_handler)
                .patch(records::update_record_handler)
                .delete(records::delete_record_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tally_core::auth::config::HashingParams;
    use tally_core::auth::notify::MemoryNotifier;

    pub fn memory_state() -> AppState {
        let mut config = ApiConfig::from_lookup(|key| match key {
            "JWT_SECRET" => Some("unit-test-secret".into()),
            _ => None,
        })
        .unwrap();
        config.auth.hashing = HashingParams::light();
        AppState::in_memory(config, Arc::new(MemoryNotifier::new())).unwrap()
    }
}
