//! `GET /api/logs?lines=` - tail today's log file.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::state::AppState;

const DEFAULT_LINES: usize = 200;
const MAX_LINES: usize = 5_000;

#[derive(Debug, Deserialize)]
pub struct TailParams {
    #[serde(default)]
    pub lines: Option<usize>,
}

pub async fn tail(
    State(state): State<AppState>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let lines = params.lines.unwrap_or(DEFAULT_LINES).min(MAX_LINES);
    let logs_dir = state.runtime.settings.data_dir().logs_dir();
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();

    let content = todays_log_file(&logs_dir, &today)
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|raw| tail_lines(&raw, lines))
        .unwrap_or_default();

    ([("content-type", "text/plain; charset=utf-8")], content)
}

/// The log file for `date` in `dir` (rolling appender naming:
/// `claude-mem.YYYY-MM-DD.log`).
fn todays_log_file(dir: &std::path::Path, date: &str) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with("claude-mem") && name.contains(date))
                .unwrap_or(false)
        })
}

fn tail_lines(raw: &str, count: usize) -> String {
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
