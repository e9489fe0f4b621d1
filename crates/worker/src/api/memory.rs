//! Retrieval endpoints: paginated lists, batch fetches, by-id lookups,
//! project enumeration, and semantic search.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::api::{coerce_id_list, error_response};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub session: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub ids: serde_json::Value,
}

fn page(params: &ListParams) -> (i64, i64) {
    (params.offset.unwrap_or(0), params.limit.unwrap_or(50))
}

// ── observations ────────────────────────────────────────────────────

pub async fn list_observations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let (offset, limit) = page(&params);
    match state
        .runtime
        .store
        .list_observations(offset, limit, params.project.as_deref())
    {
        Ok(rows) => Json(serde_json::json!({ "observations": rows, "count": rows.len() }))
            .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn observations_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    let ids = match coerce_id_list(&body.ids) {
        Ok(ids) => ids,
        Err(e) => return error_response(&e),
    };
    match state.runtime.store.observations_batch(&ids) {
        Ok(rows) => Json(serde_json::json!({ "observations": rows })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn get_observation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.runtime.store.get_observation(id) {
        Ok(row) => Json(row).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── summaries ───────────────────────────────────────────────────────

pub async fn list_summaries(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let (offset, limit) = page(&params);
    match state
        .runtime
        .store
        .list_summaries(offset, limit, params.project.as_deref())
    {
        Ok(rows) => {
            Json(serde_json::json!({ "summaries": rows, "count": rows.len() })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn summaries_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    let ids = match coerce_id_list(&body.ids) {
        Ok(ids) => ids,
        Err(e) => return error_response(&e),
    };
    match state.runtime.store.summaries_batch(&ids) {
        Ok(rows) => Json(serde_json::json!({ "summaries": rows })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn get_summary(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.runtime.store.get_summary(id) {
        Ok(row) => Json(row).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── prompts ─────────────────────────────────────────────────────────

pub async fn list_prompts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let Some(session_id) = params.session else {
        return error_response(&cm_domain::Error::Parse(
            "prompts listing requires ?session=".into(),
        ));
    };
    match state.runtime.store.list_prompts_for_session(session_id) {
        Ok(rows) => Json(serde_json::json!({ "prompts": rows, "count": rows.len() }))
            .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn prompts_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    let ids = match coerce_id_list(&body.ids) {
        Ok(ids) => ids,
        Err(e) => return error_response(&e),
    };
    match state.runtime.store.prompts_batch(&ids) {
        Ok(rows) => Json(serde_json::json!({ "prompts": rows })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn get_prompt(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.runtime.store.get_user_prompt(id) {
        Ok(row) => Json(row).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── sessions ────────────────────────────────────────────────────────

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let (offset, limit) = page(&params);
    match state
        .runtime
        .store
        .list_sessions(offset, limit, params.project.as_deref())
    {
        Ok(rows) => {
            Json(serde_json::json!({ "sessions": rows, "count": rows.len() })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn sessions_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> impl IntoResponse {
    let ids = match coerce_id_list(&body.ids) {
        Ok(ids) => ids,
        Err(e) => return error_response(&e),
    };
    match state.runtime.store.sessions_batch(&ids) {
        Ok(rows) => Json(serde_json::json!({ "sessions": rows })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.runtime.store.get_session(id) {
        Ok(row) => Json(row).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── projects ────────────────────────────────────────────────────────

pub async fn list_projects(State(state): State<AppState>) -> impl IntoResponse {
    match state.runtime.store.list_projects() {
        Ok(projects) => Json(serde_json::json!({ "projects": projects })).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── semantic search ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub project: Option<String>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let project = params.project.unwrap_or_default();
    let limit = params.limit.unwrap_or(10).clamp(1, 100);
    match state
        .runtime
        .vector
        .query(&project, &params.q, limit, None)
        .await
    {
        Ok(matches) => {
            Json(serde_json::json!({ "matches": matches, "count": matches.len() }))
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}
