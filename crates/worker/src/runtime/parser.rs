//! LLM reply parsing.
//!
//! Replies carry zero or more `<observation>` blocks and at most one
//! `<summary>` block. Unknown tags are ignored; missing sub-tags default to
//! empty. List tags (`<facts>`, `<concepts>`, `<files_read>`,
//! `<files_modified>`) accept `<item>` children or plain comma/newline
//! separated text.

use cm_domain::types::{ObservationDraft, ObservationKind, SummaryDraft};

/// Everything extracted from one reply.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub observations: Vec<ObservationDraft>,
    pub summary: Option<SummaryDraft>,
}

impl ParsedResponse {
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty() && self.summary.is_none()
    }
}

/// Parse a raw reply.
pub fn parse_response(text: &str) -> ParsedResponse {
    let observations = blocks(text, "observation")
        .into_iter()
        .map(parse_observation)
        .collect();
    let summary = blocks(text, "summary").first().map(|b| parse_summary(b));
    ParsedResponse {
        observations,
        summary,
    }
}

fn parse_observation(block: &str) -> ObservationDraft {
    ObservationDraft {
        kind: tag(block, "type").map(|t| ObservationKind::parse(&t)),
        title: tag(block, "title"),
        subtitle: tag(block, "subtitle"),
        narrative: tag(block, "narrative"),
        facts: list_tag(block, "facts"),
        concepts: list_tag(block, "concepts"),
        files_read: list_tag(block, "files_read"),
        files_modified: list_tag(block, "files_modified"),
    }
}

fn parse_summary(block: &str) -> SummaryDraft {
    SummaryDraft {
        request: tag(block, "request"),
        investigated: tag(block, "investigated"),
        learned: tag(block, "learned"),
        completed: tag(block, "completed"),
        next_steps: tag(block, "next_steps"),
        notes: tag(block, "notes"),
    }
}

// ── tag scanning ────────────────────────────────────────────────────

/// All `<name>…</name>` block bodies, in order.
fn blocks<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let body_start = start + open.len();
        let Some(end) = rest[body_start..].find(&close) else {
            break;
        };
        out.push(&rest[body_start..body_start + end]);
        rest = &rest[body_start + end + close.len()..];
    }
    out
}

/// First `<name>…</name>` body, trimmed; `None` when absent or blank.
fn tag(block: &str, name: &str) -> Option<String> {
    blocks(block, name)
        .first()
        .map(|b| b.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Items of a list tag: `<item>` children when present, otherwise the body
/// split on newlines and commas.
fn list_tag(block: &str, name: &str) -> Vec<String> {
    let Some(body) = blocks(block, name).first().copied() else {
        return Vec::new();
    };
    let items = blocks(body, "item");
    if !items.is_empty() {
        return items
            .iter()
            .map(|i| i.trim().to_owned())
            .filter(|i| !i.is_empty())
            .collect();
    }
    body.split(|c| c == '\n' || c == ',')
        .map(|i| i.trim().to_owned())
        .filter(|i| !i.is_empty())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
