//! `GET /api/context/inject` - formatted context for a fresh session.
//!
//! Hooks paste this text into the IDE surface on session start. Plain text
//! out, newest material first, bounded by the configured observation count.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use cm_domain::types::{ObservationRecord, SummaryRecord};

use crate::api::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InjectParams {
    /// Comma-separated project labels.
    #[serde(default)]
    pub projects: Option<String>,
}

pub async fn inject(
    State(state): State<AppState>,
    Query(params): Query<InjectParams>,
) -> impl IntoResponse {
    let projects: Vec<String> = params
        .projects
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
        .collect();

    let limit = state.runtime.settings.context_observations as i64;
    let mut text = String::new();

    let project_list = if projects.is_empty() {
        match state.runtime.store.list_projects() {
            Ok(all) => all.into_iter().take(1).collect(),
            Err(e) => return error_response(&e),
        }
    } else {
        projects
    };

    for project in &project_list {
        let observations = match state.runtime.store.list_observations(0, limit, Some(project)) {
            Ok(rows) => rows,
            Err(e) => return error_response(&e),
        };
        let summaries = match state.runtime.store.list_summaries(0, 1, Some(project)) {
            Ok(rows) => rows,
            Err(e) => return error_response(&e),
        };
        if observations.is_empty() && summaries.is_empty() {
            continue;
        }
        render_project(&mut text, project, &observations, summaries.first());
    }

    if text.is_empty() {
        text.push_str("No prior context recorded yet.\n");
    }
    ([("content-type", "text/plain; charset=utf-8")], text).into_response()
}

fn render_project(
    out: &mut String,
    project: &str,
    observations: &[ObservationRecord],
    latest_summary: Option<&SummaryRecord>,
) {
    out.push_str(&format!("## Memory for {project}\n\n"));

    if let Some(summary) = latest_summary {
        out.push_str("Last session:\n");
        for (label, value) in [
            ("request", &summary.request),
            ("learned", &summary.learned),
            ("completed", &summary.completed),
            ("next steps", &summary.next_steps),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                out.push_str(&format!("  {label}: {value}\n"));
            }
        }
        out.push('\n');
    }

    if !observations.is_empty() {
        out.push_str("Recent observations:\n");
        for observation in observations {
            let title = observation.title.as_deref().unwrap_or("(untitled)");
            out.push_str(&format!(
                "- [{}] {} ({})\n",
                observation.kind.as_str(),
                title,
                observation.created_at.format("%Y-%m-%d %H:%M"),
            ));
            if let Some(narrative) = observation
                .narrative
                .as_deref()
                .filter(|n| !n.is_empty())
            {
                out.push_str(&format!("  {narrative}\n"));
            }
        }
        out.push('\n');
    }
}
