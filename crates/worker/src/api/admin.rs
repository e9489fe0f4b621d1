//! Liveness, readiness, version, and admin lifecycle endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /api/health` - 200 whenever the HTTP server is up.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "initialized": state.is_initialized(),
        "mcpReady": state.runtime.vector.is_enabled(),
        "platform": std::env::consts::OS,
        "pid": std::process::id(),
    }))
}

/// `GET /api/readiness` - 200 once core init is done, 503 before.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_initialized() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "initializing" })),
        )
    }
}

/// `GET /api/version`.
pub async fn version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// `POST /api/admin/shutdown` - 202, then the supervisor tears down.
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("shutdown requested over HTTP");
    state.shutdown.cancel();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "shuttingDown": true })),
    )
}

/// `POST /api/admin/restart` - graceful re-exec.
pub async fn restart(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("restart requested over HTTP");
    state.request_restart();
    state.shutdown.cancel();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "restarting": true })),
    )
}
