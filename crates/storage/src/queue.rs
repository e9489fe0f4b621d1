//! Durable work queue over the pending_messages table.
//!
//! Claim-confirm lifecycle: rows are enqueued `pending`, claimed into
//! `processing`, and deleted on `confirm` - which callers invoke only after
//! the transaction that stored the derived data has committed. Rows stuck in
//! `processing` (a crashed or aborted runner) are self-healed back to
//! `pending` by the claim path itself.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};

use cm_domain::error::{Error, Result};
use cm_domain::types::{MessageKind, NewPendingMessage, PendingMessage, QueueStatus};

use crate::db::{now_ms, Store};

/// Stale threshold applied inside `claim_next` - authoritative for recovery.
pub const CLAIM_STALE_MS: i64 = 60_000;

/// Wider threshold used by the cross-startup sweep and visibility probes.
pub const SWEEP_STALE_MS: i64 = 300_000;

/// Soft-failure retry budget before a row is parked as `failed`.
pub const MAX_RETRIES: i64 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row of the observability view, joined to its session project.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueViewEntry {
    pub id: i64,
    pub session_id: i64,
    pub content_session_id: String,
    pub project: String,
    pub kind: MessageKind,
    pub tool_name: Option<String>,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub created_at_ms: i64,
    pub claimed_at_ms: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PendingQueue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PendingQueue {
    store: Arc<Store>,
}

impl PendingQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert a new message with status `pending`. Returns the row id.
    pub fn enqueue(
        &self,
        session_id: i64,
        content_session_id: &str,
        message: &NewPendingMessage,
    ) -> Result<i64> {
        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO pending_messages
                 (session_id, content_session_id, kind, tool_name, tool_input,
                  tool_response, last_assistant_message, cwd, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                session_id,
                content_session_id,
                message.kind.as_str(),
                message.tool_name,
                message.tool_input,
                message.tool_response,
                message.last_assistant_message,
                message.cwd,
                now_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim the oldest pending message for a session.
    ///
    /// Self-heals first: any `processing` row for this session whose claim
    /// epoch is older than [`CLAIM_STALE_MS`] is reset to `pending` and its
    /// claim epoch cleared. FIFO by insertion id.
    pub fn claim_next(&self, session_id: i64) -> Result<Option<PendingMessage>> {
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;
        let now = now_ms();

        let healed = tx.execute(
            "UPDATE pending_messages
                 SET status = 'pending', claimed_at = NULL
             WHERE session_id = ?1 AND status = 'processing' AND claimed_at < ?2",
            params![session_id, now - CLAIM_STALE_MS],
        )?;
        if healed > 0 {
            tracing::info!(session_id, count = healed, "recovered stale in-flight messages");
        }

        let message = tx
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLS} FROM pending_messages
                     WHERE session_id = ?1 AND status = 'pending'
                     ORDER BY id ASC LIMIT 1"
                ),
                params![session_id],
                message_from_row,
            )
            .optional()?;

        let message = match message {
            Some(mut m) => {
                tx.execute(
                    "UPDATE pending_messages SET status = 'processing', claimed_at = ?1
                     WHERE id = ?2",
                    params![now, m.id],
                )?;
                m.status = QueueStatus::Processing;
                m.claimed_at_ms = Some(now);
                Some(m)
            }
            None => None,
        };

        tx.commit()?;
        Ok(message)
    }

    /// Delete a confirmed message. Only called after the downstream commit
    /// that stored its derived data has succeeded.
    pub fn confirm(&self, message_id: i64) -> Result<()> {
        self.store.lock().execute(
            "DELETE FROM pending_messages WHERE id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    /// Record a soft failure (the LLM rejected the input).
    ///
    /// Retries up to [`MAX_RETRIES`] times by returning the row to `pending`;
    /// after that the row is parked as `failed`. Transport and database
    /// errors must not use this - they leave the row `processing` for
    /// self-healing instead.
    pub fn mark_failed(&self, message_id: i64) -> Result<()> {
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;

        let retry_count: i64 = tx
            .query_row(
                "SELECT retry_count FROM pending_messages WHERE id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("pending message {message_id}")))?;

        if retry_count < MAX_RETRIES {
            tx.execute(
                "UPDATE pending_messages
                     SET status = 'pending', retry_count = retry_count + 1, claimed_at = NULL
                 WHERE id = ?1",
                params![message_id],
            )?;
        } else {
            tx.execute(
                "UPDATE pending_messages
                     SET status = 'failed', completed_at = ?1
                 WHERE id = ?2",
                params![now_ms(), message_id],
            )?;
            tracing::warn!(message_id, retry_count, "message exhausted retries, parked as failed");
        }

        tx.commit()?;
        Ok(())
    }

    /// Reset `processing` rows older than `threshold_ms` back to `pending`,
    /// optionally scoped to one session. Returns how many were reset.
    pub fn reset_stale(&self, threshold_ms: i64, session_id: Option<i64>) -> Result<usize> {
        let conn = self.store.lock();
        let cutoff = now_ms() - threshold_ms;
        let reset = match session_id {
            Some(sid) => conn.execute(
                "UPDATE pending_messages SET status = 'pending', claimed_at = NULL
                 WHERE session_id = ?1 AND status = 'processing' AND claimed_at < ?2",
                params![sid, cutoff],
            )?,
            None => conn.execute(
                "UPDATE pending_messages SET status = 'pending', claimed_at = NULL
                 WHERE status = 'processing' AND claimed_at < ?1",
                params![cutoff],
            )?,
        };
        if reset > 0 {
            tracing::info!(count = reset, "reset stale in-flight messages");
        }
        Ok(reset)
    }

    // ── observability ──────────────────────────────────────────────

    /// All non-processed rows joined to their session project.
    pub fn get_queue_view(&self) -> Result<Vec<QueueViewEntry>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.session_id, m.content_session_id, s.project, m.kind,
                    m.tool_name, m.status, m.retry_count, m.created_at, m.claimed_at
             FROM pending_messages m JOIN sessions s ON s.id = m.session_id
             WHERE m.status != 'processed'
             ORDER BY m.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QueueViewEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                content_session_id: row.get(2)?,
                project: row.get(3)?,
                kind: MessageKind::parse(&row.get::<_, String>(4)?),
                tool_name: row.get(5)?,
                status: QueueStatus::parse(&row.get::<_, String>(6)?),
                retry_count: row.get(7)?,
                created_at_ms: row.get(8)?,
                claimed_at_ms: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Count of `processing` rows older than `threshold_ms`.
    pub fn get_stuck_count(&self, threshold_ms: i64) -> Result<i64> {
        let conn = self.store.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM pending_messages
             WHERE status = 'processing' AND claimed_at < ?1",
            params![now_ms() - threshold_ms],
            |row| row.get(0),
        )?)
    }

    /// Whether any work remains. Runs the wide stale sweep as a side effect
    /// so cross-startup leftovers become visible as `pending` again.
    pub fn has_any_pending_work(&self) -> Result<bool> {
        self.reset_stale(SWEEP_STALE_MS, None)?;
        let conn = self.store.lock();
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_messages
                           WHERE status IN ('pending', 'processing'))",
            [],
            |row| row.get(0),
        )?)
    }

    /// Distinct session ids that still have pending rows.
    pub fn get_sessions_with_pending_messages(&self) -> Result<Vec<i64>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT session_id FROM pending_messages
             WHERE status = 'pending' ORDER BY session_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Number of pending + processing rows for one session.
    pub fn depth(&self, session_id: i64) -> Result<i64> {
        let conn = self.store.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM pending_messages
             WHERE session_id = ?1 AND status IN ('pending', 'processing')",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    /// Most recent legacy-lifecycle rows marked `processed` (the
    /// claim-confirm path deletes rows, so this only shows old-style work).
    pub fn recently_processed(&self, limit: i64) -> Result<Vec<QueueViewEntry>> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.session_id, m.content_session_id, s.project, m.kind,
                    m.tool_name, m.status, m.retry_count, m.created_at, m.claimed_at
             FROM pending_messages m JOIN sessions s ON s.id = m.session_id
             WHERE m.status = 'processed'
             ORDER BY m.completed_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.clamp(1, 200)], |row| {
            Ok(QueueViewEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                content_session_id: row.get(2)?,
                project: row.get(3)?,
                kind: MessageKind::parse(&row.get::<_, String>(4)?),
                tool_name: row.get(5)?,
                status: QueueStatus::parse(&row.get::<_, String>(6)?),
                retry_count: row.get(7)?,
                created_at_ms: row.get(8)?,
                claimed_at_ms: row.get(9)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Drop rows parked as `failed`. Returns how many were removed.
    pub fn clear_failed(&self) -> Result<usize> {
        Ok(self
            .store
            .lock()
            .execute("DELETE FROM pending_messages WHERE status = 'failed'", [])?)
    }

    /// Drop every row that has not completed the legacy lifecycle.
    pub fn clear_all_incomplete(&self) -> Result<usize> {
        Ok(self.store.lock().execute(
            "DELETE FROM pending_messages WHERE status IN ('pending', 'processing', 'failed')",
            [],
        )?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MESSAGE_COLS: &str = "id, session_id, content_session_id, kind, tool_name, tool_input, \
                            tool_response, last_assistant_message, cwd, status, retry_count, \
                            created_at, claimed_at, completed_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<PendingMessage> {
    Ok(PendingMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content_session_id: row.get(2)?,
        kind: MessageKind::parse(&row.get::<_, String>(3)?),
        tool_name: row.get(4)?,
        tool_input: row.get(5)?,
        tool_response: row.get(6)?,
        last_assistant_message: row.get(7)?,
        cwd: row.get(8)?,
        status: QueueStatus::parse(&row.get::<_, String>(9)?),
        retry_count: row.get(10)?,
        created_at_ms: row.get(11)?,
        claimed_at_ms: row.get(12)?,
        completed_at_ms: row.get(13)?,
    })
}

/// Mark a message `processed` inside a caller-owned transaction. Retained
/// for the legacy lifecycle only; the claim-confirm path deletes rows.
pub(crate) fn mark_processed_tx(conn: &Connection, message_id: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE pending_messages SET status = 'processed', completed_at = ?1 WHERE id = ?2",
        params![now_ms(), message_id],
    )?;
    if changed == 0 {
        return Err(Error::NotFound(format!("pending message {message_id}")));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Store>, PendingQueue, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (session_id, _) = store
            .create_or_get_session("cs-1", "proj", "hello", None)
            .unwrap();
        let queue = PendingQueue::new(store.clone());
        (store, queue, session_id)
    }

    fn observation_message(tool: &str) -> NewPendingMessage {
        NewPendingMessage {
            kind: MessageKind::Observation,
            tool_name: Some(tool.into()),
            tool_input: Some(r#"{"command":"ls"}"#.into()),
            tool_response: Some("file.txt".into()),
            last_assistant_message: None,
            cwd: Some("/work".into()),
        }
    }

    #[test]
    fn claim_returns_fifo_order() {
        let (_store, queue, sid) = setup();
        let mut enqueued = Vec::new();
        for i in 0..3 {
            enqueued.push(
                queue
                    .enqueue(sid, "cs-1", &observation_message(&format!("Tool{i}")))
                    .unwrap(),
            );
        }

        for expected in &enqueued {
            let claimed = queue.claim_next(sid).unwrap().unwrap();
            assert_eq!(claimed.id, *expected);
            assert_eq!(claimed.status, QueueStatus::Processing);
            queue.confirm(claimed.id).unwrap();
        }
        assert!(queue.claim_next(sid).unwrap().is_none());
    }

    #[test]
    fn confirm_deletes_the_row() {
        let (_store, queue, sid) = setup();
        let id = queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        let claimed = queue.claim_next(sid).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        queue.confirm(id).unwrap();
        assert_eq!(queue.depth(sid).unwrap(), 0);
        assert!(queue.get_queue_view().unwrap().is_empty());
    }

    #[test]
    fn stale_processing_row_is_recovered_by_claim() {
        let (store, queue, sid) = setup();
        let id = queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        queue.claim_next(sid).unwrap().unwrap();

        // Backdate the claim epoch past the in-path threshold.
        store
            .lock()
            .execute(
                "UPDATE pending_messages SET claimed_at = claimed_at - ?1 WHERE id = ?2",
                params![CLAIM_STALE_MS + 1_000, id],
            )
            .unwrap();

        // The next claim self-heals and returns the same row.
        let reclaimed = queue.claim_next(sid).unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.status, QueueStatus::Processing);
    }

    #[test]
    fn fresh_processing_row_is_not_reclaimed() {
        let (_store, queue, sid) = setup();
        queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        queue.claim_next(sid).unwrap().unwrap();
        // Claim epoch is recent - nothing to return.
        assert!(queue.claim_next(sid).unwrap().is_none());
    }

    #[test]
    fn mark_failed_retries_then_parks() {
        let (_store, queue, sid) = setup();
        let id = queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();

        for attempt in 1..=MAX_RETRIES {
            let claimed = queue.claim_next(sid).unwrap().unwrap();
            assert_eq!(claimed.retry_count, attempt - 1);
            queue.mark_failed(id).unwrap();
        }

        // Fourth failure exceeds the budget.
        let claimed = queue.claim_next(sid).unwrap().unwrap();
        assert_eq!(claimed.retry_count, MAX_RETRIES);
        queue.mark_failed(id).unwrap();

        assert!(queue.claim_next(sid).unwrap().is_none());
        let view = queue.get_queue_view().unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].status, QueueStatus::Failed);

        assert_eq!(queue.clear_failed().unwrap(), 1);
        assert!(queue.get_queue_view().unwrap().is_empty());
    }

    #[test]
    fn has_any_pending_work_sweeps_stale_rows() {
        let (store, queue, sid) = setup();
        let id = queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        queue.claim_next(sid).unwrap().unwrap();
        store
            .lock()
            .execute(
                "UPDATE pending_messages SET claimed_at = claimed_at - ?1 WHERE id = ?2",
                params![SWEEP_STALE_MS + 1_000, id],
            )
            .unwrap();

        assert!(queue.has_any_pending_work().unwrap());
        let view = queue.get_queue_view().unwrap();
        assert_eq!(view[0].status, QueueStatus::Pending);
    }

    #[test]
    fn sessions_with_pending_messages() {
        let (store, queue, sid) = setup();
        let (other, _) = store
            .create_or_get_session("cs-2", "proj", "hi", None)
            .unwrap();
        queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        queue.enqueue(other, "cs-2", &observation_message("Read")).unwrap();

        let sessions = queue.get_sessions_with_pending_messages().unwrap();
        assert_eq!(sessions, vec![sid, other]);
    }

    #[test]
    fn clear_all_incomplete_empties_the_queue() {
        let (_store, queue, sid) = setup();
        queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        queue.enqueue(sid, "cs-1", &observation_message("Read")).unwrap();
        queue.claim_next(sid).unwrap().unwrap();

        assert_eq!(queue.clear_all_incomplete().unwrap(), 2);
        assert!(!queue.has_any_pending_work().unwrap());
    }

    #[test]
    fn stuck_count_counts_old_processing_rows() {
        let (store, queue, sid) = setup();
        let id = queue.enqueue(sid, "cs-1", &observation_message("Bash")).unwrap();
        queue.claim_next(sid).unwrap().unwrap();
        assert_eq!(queue.get_stuck_count(CLAIM_STALE_MS).unwrap(), 0);

        store
            .lock()
            .execute(
                "UPDATE pending_messages SET claimed_at = claimed_at - ?1 WHERE id = ?2",
                params![CLAIM_STALE_MS + 1_000, id],
            )
            .unwrap();
        assert_eq!(queue.get_stuck_count(CLAIM_STALE_MS).unwrap(), 1);
    }
}
