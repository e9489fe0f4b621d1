//! Persisted data model: sessions, prompts, the pending-message queue,
//! observations, and session summaries.
//!
//! `tool_input` / `tool_response` are carried as raw JSON text end to end.
//! The storage layer never parses them; typed views exist only at the HTTP
//! handler boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ended" => SessionStatus::Ended,
            _ => SessionStatus::Active,
        }
    }
}

/// One continuous user conversation, keyed externally by
/// `content_session_id` and internally by the database row id.
///
/// `memory_session_id` is owned by the worker: it is captured from the first
/// LLM reply of the session and must never equal the content id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub content_session_id: String,
    pub memory_session_id: Option<String>,
    pub project: String,
    pub title: Option<String>,
    pub first_prompt: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One user turn, ordered by `prompt_number` within its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPromptRecord {
    pub id: i64,
    pub session_id: i64,
    pub prompt_number: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Observation,
    Summarize,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Observation => "observation",
            MessageKind::Summarize => "summarize",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "summarize" => MessageKind::Summarize,
            _ => MessageKind::Observation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => QueueStatus::Processing,
            "processed" => QueueStatus::Processed,
            "failed" => QueueStatus::Failed,
            _ => QueueStatus::Pending,
        }
    }
}

/// The payload enqueued by a hook event, before it has a row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPendingMessage {
    pub kind: MessageKind,
    /// Tool name for observation messages (e.g. `"Bash"`).
    pub tool_name: Option<String>,
    /// Raw JSON blob of the tool input, stored opaque.
    pub tool_input: Option<String>,
    /// Raw JSON blob (or plain text) of the tool output, stored opaque.
    pub tool_response: Option<String>,
    /// Last assistant message, for summarize messages.
    pub last_assistant_message: Option<String>,
    /// Working-directory hint captured from the hook.
    pub cwd: Option<String>,
}

/// A work-queue row awaiting LLM processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: i64,
    pub session_id: i64,
    pub content_session_id: String,
    pub kind: MessageKind,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_response: Option<String>,
    pub last_assistant_message: Option<String>,
    pub cwd: Option<String>,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub created_at_ms: i64,
    pub claimed_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    Discovery,
    Bugfix,
    Feature,
    Refactor,
    Change,
    Decision,
    Session,
    Prompt,
}

impl ObservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::Discovery => "discovery",
            ObservationKind::Bugfix => "bugfix",
            ObservationKind::Feature => "feature",
            ObservationKind::Refactor => "refactor",
            ObservationKind::Change => "change",
            ObservationKind::Decision => "decision",
            ObservationKind::Session => "session",
            ObservationKind::Prompt => "prompt",
        }
    }

    /// Lenient parse; unknown values fall back to `discovery`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "bugfix" => ObservationKind::Bugfix,
            "feature" => ObservationKind::Feature,
            "refactor" => ObservationKind::Refactor,
            "change" => ObservationKind::Change,
            "decision" => ObservationKind::Decision,
            "session" => ObservationKind::Session,
            "prompt" => ObservationKind::Prompt,
            _ => ObservationKind::Discovery,
        }
    }
}

/// A structured record distilled from a single tool use, before storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub kind: Option<ObservationKind>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
}

/// A stored observation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    pub kind: ObservationKind,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summaries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured end-of-session artifact, before storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryDraft {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
}

/// A stored session summary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub memory_session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub discovery_tokens: i64,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One entry in the in-memory conversation history of an active session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_kind_round_trip() {
        for kind in [
            ObservationKind::Discovery,
            ObservationKind::Bugfix,
            ObservationKind::Feature,
            ObservationKind::Refactor,
            ObservationKind::Change,
            ObservationKind::Decision,
            ObservationKind::Session,
            ObservationKind::Prompt,
        ] {
            assert_eq!(ObservationKind::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_observation_kind_falls_back_to_discovery() {
        assert_eq!(
            ObservationKind::parse("something-new"),
            ObservationKind::Discovery
        );
    }

    #[test]
    fn queue_status_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Processed,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn message_kind_serde_lowercase() {
        let json = serde_json::to_string(&MessageKind::Summarize).unwrap();
        assert_eq!(json, "\"summarize\"");
    }
}
