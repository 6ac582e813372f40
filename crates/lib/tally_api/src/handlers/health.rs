//! Health check handler.

use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::models::HealthResponse;

/// `GET /api/health`: version and store reachability.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_connected = state.auth.ping().await;
    Json(HealthResponse {
        status: if store_connected { "ok" } else { "degraded" }.into(),
        version: tally_core::version().to_string(),
        store_connected,
        isolation_mode: state.database.mode().to_string(),
    })
}
