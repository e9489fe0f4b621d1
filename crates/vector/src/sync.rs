//! Mirroring and semantic query on top of the RPC client.
//!
//! One logical collection per project. Failures in the sync path are logged
//! and swallowed - the store of record is SQLite, and the mirror can always
//! be rebuilt by the backfill.

use std::sync::Arc;

use serde_json::{json, Value};

use cm_domain::error::Result;
use cm_domain::types::{ObservationRecord, SummaryRecord, UserPromptRecord};
use cm_storage::Store;

use crate::client::VectorClient;
use crate::types::{DocMetadata, DocType, QueryMatch, VectorDoc};

/// Collection names get this prefix after sanitization.
const COLLECTION_PREFIX: &str = "cm_";

/// Backfill insert batch size.
const BACKFILL_BATCH: usize = 32;

pub struct VectorSync {
    client: Arc<VectorClient>,
    enabled: bool,
}

impl VectorSync {
    pub fn new(client: Arc<VectorClient>, enabled: bool) -> Self {
        Self { client, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Close the underlying connection (shutdown path).
    pub async fn close(&self) {
        self.client.close().await;
    }

    // ── sync (fire-and-forget) ─────────────────────────────────────

    /// Mirror one observation. Errors are logged, never propagated.
    pub async fn sync_observation(&self, observation: &ObservationRecord) {
        if !self.enabled {
            return;
        }
        let docs = observation_docs(observation);
        if let Err(e) = self.upsert(&observation.project, &docs).await {
            tracing::warn!(
                id = observation.id,
                error = %e,
                "observation vector sync failed"
            );
        }
    }

    /// Mirror one session summary. Errors are logged, never propagated.
    pub async fn sync_summary(&self, summary: &SummaryRecord) {
        if !self.enabled {
            return;
        }
        let docs = summary_docs(summary);
        if let Err(e) = self.upsert(&summary.project, &docs).await {
            tracing::warn!(id = summary.id, error = %e, "summary vector sync failed");
        }
    }

    /// Mirror one user prompt. Errors are logged, never propagated.
    pub async fn sync_user_prompt(&self, project: &str, prompt: &UserPromptRecord) {
        if !self.enabled {
            return;
        }
        let docs = vec![prompt_doc(project, prompt)];
        if let Err(e) = self.upsert(project, &docs).await {
            tracing::warn!(id = prompt.id, error = %e, "prompt vector sync failed");
        }
    }

    // ── backfill ───────────────────────────────────────────────────

    /// Insert any rows missing from the project collection, in batches.
    pub async fn ensure_backfilled(&self, store: &Store, project: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let collection = collection_name(project);
        let existing = self
            .client
            .call("list", json!({ "collection": collection }))
            .await?;
        let have: std::collections::HashSet<(String, i64)> = existing
            .get("docs")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .filter_map(|d| {
                        let doc_type = d.get("doc_type")?.as_str()?.to_owned();
                        let sqlite_id = d.get("sqlite_id")?.as_i64()?;
                        Some((doc_type, sqlite_id))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut missing: Vec<VectorDoc> = Vec::new();
        for id in store.observation_ids_for_project(project)? {
            if !have.contains(&(DocType::Observation.as_str().to_owned(), id)) {
                let record = store.get_observation(id)?;
                missing.extend(observation_docs(&record));
            }
        }
        for id in store.summary_ids_for_project(project)? {
            if !have.contains(&(DocType::SessionSummary.as_str().to_owned(), id)) {
                let record = store.get_summary(id)?;
                missing.extend(summary_docs(&record));
            }
        }

        if missing.is_empty() {
            return Ok(());
        }
        tracing::info!(project, docs = missing.len(), "backfilling vector collection");
        for chunk in missing.chunks(BACKFILL_BATCH) {
            self.upsert(project, chunk).await?;
        }
        Ok(())
    }

    // ── query ──────────────────────────────────────────────────────

    /// Semantic search over a project collection.
    ///
    /// The store returns parallel arrays per document; several documents can
    /// share one `sqlite_id`, so results are deduplicated here, keeping the
    /// rank order of first appearance and the best distance per id.
    pub async fn query(
        &self,
        project: &str,
        query_text: &str,
        limit: usize,
        where_filter: Option<Value>,
    ) -> Result<Vec<QueryMatch>> {
        let mut params = json!({
            "collection": collection_name(project),
            "text": query_text,
            // Over-fetch so dedup still fills the requested limit.
            "limit": limit * 4,
        });
        if let Some(filter) = where_filter {
            params["where"] = filter;
        }
        let result = self.client.call("query", params).await?;

        let documents = str_array(&result, "documents");
        let distances: Vec<f64> = result
            .get("distances")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        let metadatas = result
            .get("metadatas")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut seen: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
        let mut matches: Vec<QueryMatch> = Vec::new();
        for (rank, metadata) in metadatas.iter().enumerate() {
            let Some(sqlite_id) = metadata.get("sqlite_id").and_then(Value::as_i64) else {
                continue;
            };
            let doc_type = match metadata.get("doc_type").and_then(Value::as_str) {
                Some("session_summary") => DocType::SessionSummary,
                Some("user_prompt") => DocType::UserPrompt,
                _ => DocType::Observation,
            };
            let distance = distances.get(rank).copied().unwrap_or(f64::MAX);

            match seen.get(&sqlite_id) {
                Some(&index) => {
                    // Same row matched again via another field: keep the
                    // original rank, improve the distance if better.
                    if distance < matches[index].distance {
                        matches[index].distance = distance;
                    }
                }
                None => {
                    if matches.len() >= limit {
                        continue;
                    }
                    seen.insert(sqlite_id, matches.len());
                    matches.push(QueryMatch {
                        sqlite_id,
                        doc_type,
                        distance,
                        text: documents.get(rank).cloned().unwrap_or_default(),
                    });
                }
            }
        }
        Ok(matches)
    }

    // ── internals ──────────────────────────────────────────────────

    async fn upsert(&self, project: &str, docs: &[VectorDoc]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        let documents: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
        let metadatas: Vec<Value> = docs
            .iter()
            .map(|d| serde_json::to_value(&d.metadata).unwrap_or(Value::Null))
            .collect();
        self.client
            .call(
                "upsert",
                json!({
                    "collection": collection_name(project),
                    "ids": ids,
                    "documents": documents,
                    "metadatas": metadatas,
                }),
            )
            .await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sanitize a project label into a collection name: allowed characters are
/// `[A-Za-z0-9._-]`, everything else becomes `_`, then the prefix is added.
pub fn collection_name(project: &str) -> String {
    let cleaned: String = project
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = if cleaned.is_empty() {
        "default".to_owned()
    } else {
        cleaned
    };
    format!("{COLLECTION_PREFIX}{cleaned}")
}

/// Split an observation into one document per semantic field: the
/// narrative, each fact, and the legacy title text.
pub fn observation_docs(record: &ObservationRecord) -> Vec<VectorDoc> {
    let metadata = DocMetadata {
        sqlite_id: record.id,
        project: record.project.clone(),
        doc_type: DocType::Observation,
        created_at_epoch: record.created_at.timestamp(),
    };
    let mut docs = Vec::new();

    if let Some(narrative) = record.narrative.as_deref().filter(|s| !s.is_empty()) {
        docs.push(VectorDoc {
            id: format!("obs_{}_narrative", record.id),
            text: narrative.to_owned(),
            metadata: metadata.clone(),
        });
    }
    for (index, fact) in record.facts.iter().filter(|f| !f.is_empty()).enumerate() {
        docs.push(VectorDoc {
            id: format!("obs_{}_fact_{index}", record.id),
            text: fact.clone(),
            metadata: metadata.clone(),
        });
    }
    let legacy = match (record.title.as_deref(), record.subtitle.as_deref()) {
        (Some(t), Some(s)) if !t.is_empty() && !s.is_empty() => format!("{t}: {s}"),
        (Some(t), _) if !t.is_empty() => t.to_owned(),
        (_, Some(s)) if !s.is_empty() => s.to_owned(),
        _ => String::new(),
    };
    if !legacy.is_empty() {
        docs.push(VectorDoc {
            id: format!("obs_{}_text", record.id),
            text: legacy,
            metadata,
        });
    }
    docs
}

/// Split a summary into one document per field.
pub fn summary_docs(record: &SummaryRecord) -> Vec<VectorDoc> {
    let metadata = DocMetadata {
        sqlite_id: record.id,
        project: record.project.clone(),
        doc_type: DocType::SessionSummary,
        created_at_epoch: record.created_at.timestamp(),
    };
    let fields = [
        ("request", record.request.as_deref()),
        ("investigated", record.investigated.as_deref()),
        ("learned", record.learned.as_deref()),
        ("completed", record.completed.as_deref()),
        ("next_steps", record.next_steps.as_deref()),
        ("notes", record.notes.as_deref()),
    ];
    fields
        .iter()
        .filter_map(|(field, value)| {
            let text = (*value)?.trim();
            if text.is_empty() {
                return None;
            }
            Some(VectorDoc {
                id: format!("sum_{}_{field}", record.id),
                text: text.to_owned(),
                metadata: metadata.clone(),
            })
        })
        .collect()
}

/// A user prompt becomes a single document.
pub fn prompt_doc(project: &str, record: &UserPromptRecord) -> VectorDoc {
    VectorDoc {
        id: format!("prompt_{}", record.id),
        text: record.text.clone(),
        metadata: DocMetadata {
            sqlite_id: record.id,
            project: project.to_owned(),
            doc_type: DocType::UserPrompt,
            created_at_epoch: record.created_at.timestamp(),
        },
    }
}

fn str_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
