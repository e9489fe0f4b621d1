//! Document shapes exchanged with the vector store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Observation,
    SessionSummary,
    UserPrompt,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Observation => "observation",
            DocType::SessionSummary => "session_summary",
            DocType::UserPrompt => "user_prompt",
        }
    }
}

/// Metadata carried by every document, regardless of shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    pub sqlite_id: i64,
    pub project: String,
    pub doc_type: DocType,
    pub created_at_epoch: i64,
}

/// One embeddable document. Observations and summaries are split into one
/// document per semantic field, so several documents share a `sqlite_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDoc {
    pub id: String,
    pub text: String,
    pub metadata: DocMetadata,
}

/// One result of a semantic query, already deduplicated by `sqlite_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMatch {
    pub sqlite_id: i64,
    pub doc_type: DocType,
    /// Best (smallest) distance among the documents sharing this id.
    pub distance: f64,
    /// Text of the best-ranked document for this id.
    pub text: String,
}
