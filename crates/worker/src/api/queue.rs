//! Queue observability and control endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use cm_storage::queue::CLAIM_STALE_MS;

use crate::api::error_response;
use crate::state::AppState;

/// `GET /api/processing-status` - queue depth across active sessions.
pub async fn processing_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "activeSessions": state.sessions.active_session_count(),
        "totalActiveWork": state.sessions.get_total_active_work(),
    }))
}

/// `GET /api/pending-queue` - the full non-processed view plus counters.
pub async fn view(State(state): State<AppState>) -> impl IntoResponse {
    let queue = &state.runtime.queue;
    let entries = match queue.get_queue_view() {
        Ok(entries) => entries,
        Err(e) => return error_response(&e),
    };
    let stuck = queue.get_stuck_count(CLAIM_STALE_MS).unwrap_or(0);
    let has_work = queue.has_any_pending_work().unwrap_or(false);
    let recent = queue.recently_processed(20).unwrap_or_default();
    Json(serde_json::json!({
        "entries": entries,
        "count": entries.len(),
        "stuckCount": stuck,
        "hasPendingWork": has_work,
        "recentlyProcessed": recent,
    }))
    .into_response()
}

/// `POST /api/pending-queue/process` - kick generators for all sessions
/// with pending rows.
pub async fn process(State(state): State<AppState>) -> impl IntoResponse {
    match state.sessions.kick_all_pending() {
        Ok(kicked) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "kicked": kicked })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `DELETE /api/pending-queue/failed`.
pub async fn clear_failed(State(state): State<AppState>) -> impl IntoResponse {
    match state.runtime.queue.clear_failed() {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `DELETE /api/pending-queue/all`.
pub async fn clear_all(State(state): State<AppState>) -> impl IntoResponse {
    match state.runtime.queue.clear_all_incomplete() {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => error_response(&e),
    }
}
