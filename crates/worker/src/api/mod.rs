pub mod admin;
pub mod context;
pub mod guard;
pub mod logs;
pub mod memory;
pub mod queue;
pub mod sessions;
pub mod stream;

use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};

use cm_domain::error::Error;

use crate::state::AppState;

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health / admin
        .route("/api/health", get(admin::health))
        .route("/api/readiness", get(admin::readiness))
        .route("/api/version", get(admin::version))
        .route("/api/admin/shutdown", post(admin::shutdown))
        .route("/api/admin/restart", post(admin::restart))
        // Session lifecycle (hook surface)
        .route("/api/sessions/init", post(sessions::init))
        .route("/api/sessions/:id/init", post(sessions::init_by_id))
        .route("/api/sessions/observations", post(sessions::observations))
        .route("/api/sessions/summarize", post(sessions::summarize))
        .route("/api/sessions/complete", post(sessions::complete))
        // Retrieval
        .route("/api/observations", get(memory::list_observations))
        .route("/api/observations/batch", post(memory::observations_batch))
        .route("/api/observation/:id", get(memory::get_observation))
        .route("/api/summaries", get(memory::list_summaries))
        .route("/api/summaries/batch", post(memory::summaries_batch))
        .route("/api/summary/:id", get(memory::get_summary))
        .route("/api/prompts", get(memory::list_prompts))
        .route("/api/prompts/batch", post(memory::prompts_batch))
        .route("/api/prompt/:id", get(memory::get_prompt))
        .route("/api/sessions", get(memory::list_sessions))
        .route("/api/sessions/batch", post(memory::sessions_batch))
        .route("/api/session/:id", get(memory::get_session))
        .route("/api/projects", get(memory::list_projects))
        .route("/api/search", get(memory::search))
        // Queue observability
        .route("/api/processing-status", get(queue::processing_status))
        .route("/api/pending-queue", get(queue::view))
        .route("/api/pending-queue/process", post(queue::process))
        .route("/api/pending-queue/failed", delete(queue::clear_failed))
        .route("/api/pending-queue/all", delete(queue::clear_all))
        // Context + logs + events
        .route("/api/context/inject", get(context::inject))
        .route("/api/logs", get(logs::tail))
        .route("/api/stream/events", get(stream::events))
        .layer(middleware::from_fn(guard::require_loopback))
        .layer(build_cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the localhost surface: requests with no Origin pass untouched,
/// and any port on `http://localhost` / `http://127.0.0.1` is allowed. The
/// port remainder must be digits only, so `http://localhost:3000.evil.com`
/// does not slip through the prefix check.
pub fn build_cors_layer() -> CorsLayer {
    let prefixes = ["http://localhost:", "http://127.0.0.1:"];
    let exact: Vec<HeaderValue> = ["http://localhost", "http://127.0.0.1"]
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let allow_origin = AllowOrigin::predicate(move |origin, _| {
        let origin_str = origin.to_str().unwrap_or("");
        if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
            return true;
        }
        prefixes.iter().any(|prefix| {
            origin_str
                .strip_prefix(prefix)
                .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error translation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a domain error onto an HTTP response.
pub fn error_response(e: &Error) -> Response {
    let (status, message) = match e {
        Error::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
        Error::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
        Error::Parse(m) | Error::Config(m) => (StatusCode::BAD_REQUEST, m.clone()),
        Error::Busy(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
        other => {
            tracing::error!(error = %other, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    };
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Body coercion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coerce an id list that may arrive MCP-style: a real JSON array, a
/// string-encoded array (`"[1,2,3]"`), or a bare comma list (`"1,2,3"`).
pub fn coerce_id_list(value: &serde_json::Value) -> Result<Vec<i64>, Error> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_i64()
                    .or_else(|| item.as_str().and_then(|s| s.trim().parse().ok()))
                    .ok_or_else(|| Error::Parse(format!("not an id: {item}")))
            })
            .collect(),
        serde_json::Value::String(raw) => {
            let raw = raw.trim();
            if raw.starts_with('[') {
                let parsed: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|e| Error::Parse(format!("id list: {e}")))?;
                coerce_id_list(&parsed)
            } else if raw.is_empty() {
                Ok(Vec::new())
            } else {
                raw.split(',')
                    .map(|part| {
                        part.trim()
                            .parse()
                            .map_err(|_| Error::Parse(format!("not an id: {part}")))
                    })
                    .collect()
            }
        }
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(Error::Parse(format!("expected an id list, got {other}"))),
    }
}

/// Coerce an opaque JSON blob field to its raw text form for storage.
pub fn blob_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_list_accepts_all_three_shapes() {
        assert_eq!(coerce_id_list(&json!([1, 2, 3])).unwrap(), vec![1, 2, 3]);
        assert_eq!(coerce_id_list(&json!("[1,2,3]")).unwrap(), vec![1, 2, 3]);
        assert_eq!(coerce_id_list(&json!("1, 2,3")).unwrap(), vec![1, 2, 3]);
        assert_eq!(coerce_id_list(&json!(["4", 5])).unwrap(), vec![4, 5]);
        assert!(coerce_id_list(&json!("")).unwrap().is_empty());
        assert!(coerce_id_list(&json!(null)).unwrap().is_empty());
    }

    #[test]
    fn id_list_rejects_garbage() {
        assert!(coerce_id_list(&json!("1,two,3")).is_err());
        assert!(coerce_id_list(&json!({"ids": [1]})).is_err());
        assert!(coerce_id_list(&json!([true])).is_err());
    }

    #[test]
    fn blobs_keep_raw_json_text() {
        assert_eq!(
            blob_to_string(&json!({"command": "ls"})).as_deref(),
            Some(r#"{"command":"ls"}"#)
        );
        assert_eq!(blob_to_string(&json!("plain")).as_deref(), Some("plain"));
        assert!(blob_to_string(&json!(null)).is_none());
    }
}
