//! Composite atomic commits.
//!
//! `store_observations` writes a batch of observations plus an optional
//! summary in one transaction, deduplicating by content hash within a
//! sliding window. The returned id list is index-aligned with the input so
//! callers can map queue messages to stored rows.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use cm_domain::error::Result;
use cm_domain::types::{ObservationDraft, ObservationKind, SummaryDraft};

use crate::db::{now_ms, to_json_list, Store};
use crate::queue::mark_processed_tx;

/// Two rows with the same content hash within this window collapse to one.
pub const DEDUP_WINDOW_MS: i64 = 30_000;

/// Result of one composite commit.
#[derive(Debug, Clone)]
pub struct StoredBatch {
    /// Stored observation ids, index-aligned with the input drafts.
    /// A deduplicated draft yields the id of the earlier row.
    pub observation_ids: Vec<i64>,
    pub summary_id: Option<i64>,
    /// The timestamp rows were stored under (epoch millis).
    pub created_at_ms: i64,
}

/// First 16 hex chars of SHA-256 over session id + title + narrative.
pub fn content_hash(memory_session_id: &str, title: &str, narrative: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(memory_session_id.as_bytes());
    hasher.update(title.as_bytes());
    hasher.update(narrative.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Store a batch of observations and an optional summary atomically.
///
/// `override_ts_ms` backdates the rows to when the underlying event was
/// captured (the earliest pending timestamp) rather than when the LLM
/// finished; `None` uses the current time.
#[allow(clippy::too_many_arguments)]
pub fn store_observations(
    store: &Store,
    memory_session_id: &str,
    project: &str,
    observations: &[ObservationDraft],
    summary: Option<&SummaryDraft>,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
    override_ts_ms: Option<i64>,
) -> Result<StoredBatch> {
    commit_batch(
        store,
        memory_session_id,
        project,
        observations,
        summary,
        prompt_number,
        discovery_tokens,
        override_ts_ms,
        None,
    )
}

/// Legacy variant: additionally marks a pending-message row `processed`
/// inside the same transaction. Kept for the old lifecycle only - the
/// claim-confirm path never uses it.
#[allow(clippy::too_many_arguments)]
pub fn store_observations_marking_processed(
    store: &Store,
    memory_session_id: &str,
    project: &str,
    observations: &[ObservationDraft],
    summary: Option<&SummaryDraft>,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
    override_ts_ms: Option<i64>,
    pending_message_id: i64,
) -> Result<StoredBatch> {
    commit_batch(
        store,
        memory_session_id,
        project,
        observations,
        summary,
        prompt_number,
        discovery_tokens,
        override_ts_ms,
        Some(pending_message_id),
    )
}

#[allow(clippy::too_many_arguments)]
fn commit_batch(
    store: &Store,
    memory_session_id: &str,
    project: &str,
    observations: &[ObservationDraft],
    summary: Option<&SummaryDraft>,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
    override_ts_ms: Option<i64>,
    mark_processed: Option<i64>,
) -> Result<StoredBatch> {
    let mut conn = store.lock();
    let tx = conn.transaction()?;
    let created_at = override_ts_ms.unwrap_or_else(now_ms);

    let mut observation_ids = Vec::with_capacity(observations.len());
    for draft in observations {
        observation_ids.push(insert_or_dedup(
            &tx,
            memory_session_id,
            project,
            draft,
            prompt_number,
            discovery_tokens,
            created_at,
        )?);
    }

    let summary_id = match summary {
        Some(s) => Some(insert_summary(
            &tx,
            memory_session_id,
            project,
            s,
            discovery_tokens,
            created_at,
        )?),
        None => None,
    };

    if let Some(message_id) = mark_processed {
        mark_processed_tx(&tx, message_id)?;
    }

    tx.commit()?;
    Ok(StoredBatch {
        observation_ids,
        summary_id,
        created_at_ms: created_at,
    })
}

fn insert_or_dedup(
    conn: &Connection,
    memory_session_id: &str,
    project: &str,
    draft: &ObservationDraft,
    prompt_number: Option<i64>,
    discovery_tokens: i64,
    created_at: i64,
) -> Result<i64> {
    let title = draft.title.as_deref().unwrap_or("");
    let narrative = draft.narrative.as_deref().unwrap_or("");
    let hash = content_hash(memory_session_id, title, narrative);

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM observations
             WHERE content_hash = ?1 AND created_at >= ?2
             ORDER BY id ASC LIMIT 1",
            params![hash, created_at - DEDUP_WINDOW_MS],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        tracing::debug!(id, hash = %hash, "duplicate observation within window, reusing row");
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO observations
             (memory_session_id, project, kind, title, subtitle, narrative, facts, concepts,
              files_read, files_modified, prompt_number, discovery_tokens, created_at,
              content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            memory_session_id,
            project,
            draft.kind.unwrap_or(ObservationKind::Discovery).as_str(),
            draft.title,
            draft.subtitle,
            draft.narrative,
            to_json_list(&draft.facts),
            to_json_list(&draft.concepts),
            to_json_list(&draft.files_read),
            to_json_list(&draft.files_modified),
            prompt_number,
            discovery_tokens,
            created_at,
            hash,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_summary(
    conn: &Connection,
    memory_session_id: &str,
    project: &str,
    draft: &SummaryDraft,
    discovery_tokens: i64,
    created_at: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO summaries
             (memory_session_id, project, request, investigated, learned, completed,
              next_steps, notes, discovery_tokens, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            memory_session_id,
            project,
            draft.request,
            draft.investigated,
            draft.learned,
            draft.completed,
            draft.next_steps,
            draft.notes,
            discovery_tokens,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use cm_domain::types::{MessageKind, NewPendingMessage, QueueStatus};
    use std::sync::Arc;

    fn draft(title: &str, narrative: &str) -> ObservationDraft {
        ObservationDraft {
            kind: Some(ObservationKind::Discovery),
            title: Some(title.into()),
            subtitle: None,
            narrative: Some(narrative.into()),
            facts: vec!["fact one".into(), "fact two".into()],
            concepts: vec!["queues".into()],
            files_read: vec!["src/lib.rs".into()],
            files_modified: vec![],
        }
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let store = Store::open_in_memory().unwrap();
        let batch = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("List dir", "Listed the working directory")],
            None,
            Some(3),
            120,
            None,
        )
        .unwrap();

        let row = store.get_observation(batch.observation_ids[0]).unwrap();
        assert_eq!(row.kind, ObservationKind::Discovery);
        assert_eq!(row.title.as_deref(), Some("List dir"));
        assert_eq!(
            row.narrative.as_deref(),
            Some("Listed the working directory")
        );
        assert_eq!(row.facts, vec!["fact one", "fact two"]);
        assert_eq!(row.concepts, vec!["queues"]);
        assert_eq!(row.files_read, vec!["src/lib.rs"]);
        assert!(row.files_modified.is_empty());
        assert_eq!(row.prompt_number, Some(3));
        assert_eq!(row.discovery_tokens, 120);
        assert_eq!(row.content_hash.len(), 16);
    }

    #[test]
    fn duplicate_within_window_collapses_to_first_id() {
        let store = Store::open_in_memory().unwrap();
        let t0 = now_ms();
        let first = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("same", "same text")],
            None,
            None,
            0,
            Some(t0),
        )
        .unwrap();
        let second = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("same", "same text")],
            None,
            None,
            0,
            Some(t0 + 5_000),
        )
        .unwrap();

        assert_eq!(first.observation_ids, second.observation_ids);
        assert_eq!(store.list_observations(0, 10, None).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_outside_window_stores_twice() {
        let store = Store::open_in_memory().unwrap();
        let t0 = now_ms();
        let first = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("same", "same text")],
            None,
            None,
            0,
            Some(t0),
        )
        .unwrap();
        let second = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("same", "same text")],
            None,
            None,
            0,
            Some(t0 + DEDUP_WINDOW_MS + 1_000),
        )
        .unwrap();

        assert_ne!(first.observation_ids, second.observation_ids);
        assert_eq!(store.list_observations(0, 10, None).unwrap().len(), 2);
    }

    #[test]
    fn different_sessions_never_dedup() {
        let store = Store::open_in_memory().unwrap();
        let t0 = now_ms();
        let a = store_observations(
            &store, "mem-a", "proj", &[draft("t", "n")], None, None, 0, Some(t0),
        )
        .unwrap();
        let b = store_observations(
            &store, "mem-b", "proj", &[draft("t", "n")], None, None, 0, Some(t0),
        )
        .unwrap();
        assert_ne!(a.observation_ids, b.observation_ids);
    }

    #[test]
    fn summary_shares_the_batch_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let ts = now_ms() - 90_000;
        let summary = SummaryDraft {
            request: Some("fix the bug".into()),
            investigated: Some("looked at the queue".into()),
            learned: None,
            completed: Some("patched claim_next".into()),
            next_steps: None,
            notes: None,
        };
        let batch = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("t", "n")],
            Some(&summary),
            None,
            50,
            Some(ts),
        )
        .unwrap();

        let row = store.get_summary(batch.summary_id.unwrap()).unwrap();
        assert_eq!(row.request.as_deref(), Some("fix the bug"));
        assert_eq!(row.created_at.timestamp_millis(), ts);
        let obs = store.get_observation(batch.observation_ids[0]).unwrap();
        assert_eq!(obs.created_at.timestamp_millis(), ts);
    }

    #[test]
    fn ids_are_index_aligned_with_input() {
        let store = Store::open_in_memory().unwrap();
        let t0 = now_ms();
        // Middle draft duplicates the first.
        let batch = store_observations(
            &store,
            "mem-1",
            "proj",
            &[draft("a", "n1"), draft("a", "n1"), draft("b", "n2")],
            None,
            None,
            0,
            Some(t0),
        )
        .unwrap();
        assert_eq!(batch.observation_ids.len(), 3);
        assert_eq!(batch.observation_ids[0], batch.observation_ids[1]);
        assert_ne!(batch.observation_ids[0], batch.observation_ids[2]);
    }

    #[test]
    fn legacy_variant_marks_message_processed_atomically() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (sid, _) = store
            .create_or_get_session("cs-1", "proj", "u", None)
            .unwrap();
        let queue = crate::queue::PendingQueue::new(store.clone());
        let message_id = queue
            .enqueue(
                sid,
                "cs-1",
                &NewPendingMessage {
                    kind: MessageKind::Observation,
                    tool_name: Some("Bash".into()),
                    tool_input: None,
                    tool_response: None,
                    last_assistant_message: None,
                    cwd: None,
                },
            )
            .unwrap();

        store_observations_marking_processed(
            &store,
            "mem-1",
            "proj",
            &[draft("t", "n")],
            None,
            None,
            0,
            None,
            message_id,
        )
        .unwrap();

        // Row survives (legacy lifecycle) but is out of the live queue view.
        assert!(queue.claim_next(sid).unwrap().is_none());
        assert!(queue
            .get_queue_view()
            .unwrap()
            .iter()
            .all(|e| e.status != QueueStatus::Pending));
    }

    #[test]
    fn legacy_variant_rolls_back_on_missing_message() {
        let store = Store::open_in_memory().unwrap();
        let result = store_observations_marking_processed(
            &store,
            "mem-1",
            "proj",
            &[draft("t", "n")],
            None,
            None,
            0,
            None,
            12345,
        );
        assert!(result.is_err());
        // The observation insert must have rolled back with it.
        assert!(store.list_observations(0, 10, None).unwrap().is_empty());
    }

    #[test]
    fn content_hash_is_stable_and_16_chars() {
        let a = content_hash("mem", "title", "narrative");
        let b = content_hash("mem", "title", "narrative");
        let c = content_hash("mem", "title", "different");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
