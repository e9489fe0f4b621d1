//! Hook-facing session endpoints: init, tool events, summarize, complete.
//!
//! Every handler logs on entry. Tool input/output blobs stay opaque -
//! they are flattened to raw JSON text and never inspected here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use cm_domain::types::{MessageKind, NewPendingMessage};

use crate::api::{blob_to_string, error_response};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/init
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitBody {
    pub content_session_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

pub async fn init(
    State(state): State<AppState>,
    Json(body): Json<InitBody>,
) -> impl IntoResponse {
    tracing::info!(
        content_session_id = %body.content_session_id,
        platform = body.platform.as_deref().unwrap_or("unknown"),
        "session init"
    );

    let project = body.project.clone().unwrap_or_default();
    if !project.is_empty() && state.runtime.settings.is_project_excluded(&project) {
        tracing::info!(project = %project, "project excluded, skipping capture");
        return Json(serde_json::json!({
            "sessionDbId": null,
            "promptNumber": 0,
            "contextInjected": false,
            "skipped": true,
        }))
        .into_response();
    }

    match state.sessions.ensure_started(
        &body.content_session_id,
        &project,
        body.user_prompt.as_deref().unwrap_or(""),
        body.cwd.as_deref(),
    ) {
        Ok(result) => Json(serde_json::json!({
            "sessionDbId": result.session_db_id,
            "promptNumber": result.prompt_number,
            "contextInjected": result.context_injected,
            "skipped": false,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/:id/init
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start (or restart) the agent generator for an existing session.
pub async fn init_by_id(
    State(state): State<AppState>,
    Path(session_db_id): Path<i64>,
) -> impl IntoResponse {
    tracing::info!(session_db_id, "generator start requested");
    match state.runtime.store.get_session(session_db_id) {
        Ok(row) => {
            state.sessions.kick(&row);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "started": true })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/observations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ObservationBody {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub tool_response: serde_json::Value,
    #[serde(default)]
    pub cwd: Option<String>,
}

pub async fn observations(
    State(state): State<AppState>,
    Json(body): Json<ObservationBody>,
) -> impl IntoResponse {
    tracing::info!(
        content_session_id = %body.content_session_id,
        tool = %body.tool_name,
        "tool event received"
    );

    let session_db_id = match resolve_session(&state, &body.content_session_id, body.cwd.as_deref())
    {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    let message = NewPendingMessage {
        kind: MessageKind::Observation,
        tool_name: Some(body.tool_name),
        tool_input: blob_to_string(&body.tool_input),
        tool_response: blob_to_string(&body.tool_response),
        last_assistant_message: None,
        cwd: body.cwd,
    };
    match state.sessions.enqueue(session_db_id, &message) {
        Ok(message_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "queued": true, "messageId": message_id })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/summarize
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SummarizeBody {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    #[serde(default)]
    pub last_assistant_message: Option<String>,
}

pub async fn summarize(
    State(state): State<AppState>,
    Json(body): Json<SummarizeBody>,
) -> impl IntoResponse {
    tracing::info!(content_session_id = %body.content_session_id, "summarize requested");

    let session_db_id = match resolve_session(&state, &body.content_session_id, None) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    let message = NewPendingMessage {
        kind: MessageKind::Summarize,
        tool_name: None,
        tool_input: None,
        tool_response: None,
        last_assistant_message: body.last_assistant_message,
        cwd: None,
    };
    match state.sessions.enqueue(session_db_id, &message) {
        Ok(message_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "queued": true, "messageId": message_id })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/complete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
}

pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteBody>,
) -> impl IntoResponse {
    tracing::info!(content_session_id = %body.content_session_id, "session complete");

    let row = match state
        .runtime
        .store
        .get_session_by_content_id(&body.content_session_id)
    {
        Ok(Some(row)) => row,
        Ok(None) => {
            return error_response(&cm_domain::Error::NotFound(format!(
                "session {}",
                body.content_session_id
            )))
        }
        Err(e) => return error_response(&e),
    };

    match state.sessions.delete_session(row.id).await {
        Ok(()) => Json(serde_json::json!({ "ended": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── shared ──────────────────────────────────────────────────────────

/// Session row id for a content id, creating the row when the hook sends
/// events before init.
fn resolve_session(
    state: &AppState,
    content_session_id: &str,
    cwd: Option<&str>,
) -> cm_domain::Result<i64> {
    if let Some(row) = state
        .runtime
        .store
        .get_session_by_content_id(content_session_id)?
    {
        return Ok(row.id);
    }
    let project = cwd
        .and_then(|dir| {
            std::path::Path::new(dir)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    let (id, _) = state
        .runtime
        .store
        .create_or_get_session(content_session_id, &project, "", None)?;
    Ok(id)
}
