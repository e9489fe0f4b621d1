//! SQLite store: schema migrations and typed row primitives.
//!
//! The connection is wrapped in a `parking_lot::Mutex` - the worker is a
//! single-writer system and every component shares this one handle.
//! Migrations are gated on `PRAGMA user_version` and safe to re-run.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use cm_domain::error::{Error, Result};
use cm_domain::types::{
    ObservationKind, ObservationRecord, SessionRecord, SessionStatus, SummaryRecord,
    UserPromptRecord,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Migrations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Numbered migration steps. `user_version` records how many have run, so
/// re-running on an up-to-date database is a no-op.
const MIGRATIONS: &[&str] = &[
    // 1: base schema
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_session_id TEXT NOT NULL UNIQUE,
        memory_session_id TEXT UNIQUE,
        project TEXT NOT NULL DEFAULT '',
        title TEXT,
        first_prompt TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_prompts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        prompt_number INTEGER NOT NULL,
        text TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(session_id, prompt_number)
    );

    CREATE TABLE IF NOT EXISTS pending_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        content_session_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        tool_name TEXT,
        tool_input TEXT,
        tool_response TEXT,
        last_assistant_message TEXT,
        cwd TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        claimed_at INTEGER,
        completed_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS observations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        memory_session_id TEXT NOT NULL,
        project TEXT NOT NULL,
        kind TEXT NOT NULL,
        title TEXT,
        subtitle TEXT,
        narrative TEXT,
        facts TEXT NOT NULL DEFAULT '[]',
        concepts TEXT NOT NULL DEFAULT '[]',
        files_read TEXT NOT NULL DEFAULT '[]',
        files_modified TEXT NOT NULL DEFAULT '[]',
        prompt_number INTEGER,
        discovery_tokens INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        content_hash TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS summaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        memory_session_id TEXT NOT NULL,
        project TEXT NOT NULL,
        request TEXT,
        investigated TEXT,
        learned TEXT,
        completed TEXT,
        next_steps TEXT,
        notes TEXT,
        discovery_tokens INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pending_session_status
        ON pending_messages(session_id, status, id);
    CREATE INDEX IF NOT EXISTS idx_observations_hash
        ON observations(content_hash, created_at);
    CREATE INDEX IF NOT EXISTS idx_observations_project
        ON observations(project, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_observations_session
        ON observations(memory_session_id);
    CREATE INDEX IF NOT EXISTS idx_summaries_project
        ON summaries(project, created_at DESC);
    "#,
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let pending = &MIGRATIONS[(version as usize).min(MIGRATIONS.len())..];
        if pending.is_empty() {
            return Ok(());
        }
        for (offset, step) in pending.iter().enumerate() {
            let target = version + offset as i64 + 1;
            let tx = conn.transaction()?;
            tx.execute_batch(step)?;
            tx.pragma_update(None, "user_version", target)?;
            tx.commit()?;
            tracing::info!(version = target, "applied schema migration");
        }
        Ok(())
    }

    /// Exclusive access to the underlying connection. Used by the queue and
    /// the composite-transaction module, which live in this crate.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Checkpoint the WAL. Called once during shutdown.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Sessions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Insert-or-get a session row for a content id.
    ///
    /// Back-fills empty `project` / `title` / `first_prompt` on later calls.
    /// Never touches `memory_session_id`. Returns `(session_db_id, created)`.
    pub fn create_or_get_session(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
        title: Option<&str>,
    ) -> Result<(i64, bool)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = now_ms();

        let inserted = tx.execute(
            "INSERT INTO sessions
                 (content_session_id, project, title, first_prompt, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
             ON CONFLICT(content_session_id) DO NOTHING",
            params![content_session_id, project, title, empty_to_null(user_prompt), now],
        )?;

        let id: i64 = tx.query_row(
            "SELECT id FROM sessions WHERE content_session_id = ?1",
            params![content_session_id],
            |row| row.get(0),
        )?;

        if inserted == 0 {
            tx.execute(
                "UPDATE sessions SET
                     project = CASE WHEN project = '' AND ?2 != '' THEN ?2 ELSE project END,
                     title = COALESCE(title, ?3),
                     first_prompt = COALESCE(first_prompt, ?4),
                     updated_at = ?5
                 WHERE id = ?1",
                params![id, project, title, empty_to_null(user_prompt), now],
            )?;
        }

        tx.commit()?;
        Ok((id, inserted > 0))
    }

    /// Record (or reset) the memory session id established by the provider.
    ///
    /// When a previous id exists and a new one is supplied, observation and
    /// summary rows filed under the old id are moved to the new one in the
    /// same transaction, so a resumed session keeps one memory thread.
    pub fn set_memory_session_id(
        &self,
        session_db_id: i64,
        memory_session_id: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let old: Option<String> = tx
            .query_row(
                "SELECT memory_session_id FROM sessions WHERE id = ?1",
                params![session_db_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("session {session_db_id}")))?;

        if let (Some(old_id), Some(new_id)) = (old.as_deref(), memory_session_id) {
            if old_id != new_id {
                tx.execute(
                    "UPDATE observations SET memory_session_id = ?1 WHERE memory_session_id = ?2",
                    params![new_id, old_id],
                )?;
                tx.execute(
                    "UPDATE summaries SET memory_session_id = ?1 WHERE memory_session_id = ?2",
                    params![new_id, old_id],
                )?;
            }
        }

        tx.execute(
            "UPDATE sessions SET memory_session_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![memory_session_id, now_ms(), session_db_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_session(&self, id: i64) -> Result<SessionRecord> {
        self.lock()
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    pub fn get_session_by_content_id(&self, content_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE content_session_id = ?1"),
                params![content_id],
                session_from_row,
            )
            .optional()?)
    }

    pub fn mark_session_ended(&self, id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE sessions SET status = 'ended', updated_at = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )?;
        Ok(())
    }

    pub fn sessions_batch(&self, ids: &[i64]) -> Result<Vec<SessionRecord>> {
        self.batch(SESSION_COLS, "sessions", ids, session_from_row)
    }

    pub fn list_sessions(
        &self,
        offset: i64,
        limit: i64,
        project: Option<&str>,
    ) -> Result<Vec<SessionRecord>> {
        self.list(SESSION_COLS, "sessions", "updated_at", offset, limit, project, session_from_row)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // User prompts
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Append a user prompt, returning the stored row (prompt numbers are
    /// 1-based within the session).
    pub fn append_user_prompt(&self, session_id: i64, text: &str) -> Result<UserPromptRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let number: i64 = tx.query_row(
            "SELECT COALESCE(MAX(prompt_number), 0) + 1 FROM user_prompts WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let now = now_ms();
        tx.execute(
            "INSERT INTO user_prompts (session_id, prompt_number, text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, number, text, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(UserPromptRecord {
            id,
            session_id,
            prompt_number: number,
            text: text.to_owned(),
            created_at: ms_to_datetime(now),
        })
    }

    /// Highest prompt number recorded for a session (0 when none).
    pub fn latest_prompt_number(&self, session_id: i64) -> Result<i64> {
        Ok(self.lock().query_row(
            "SELECT COALESCE(MAX(prompt_number), 0) FROM user_prompts WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    pub fn get_user_prompt(&self, id: i64) -> Result<UserPromptRecord> {
        self.lock()
            .query_row(
                &format!("SELECT {PROMPT_COLS} FROM user_prompts WHERE id = ?1"),
                params![id],
                prompt_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("user prompt {id}")))
    }

    pub fn prompts_batch(&self, ids: &[i64]) -> Result<Vec<UserPromptRecord>> {
        self.batch(PROMPT_COLS, "user_prompts", ids, prompt_from_row)
    }

    pub fn list_prompts_for_session(&self, session_id: i64) -> Result<Vec<UserPromptRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROMPT_COLS} FROM user_prompts WHERE session_id = ?1 ORDER BY prompt_number"
        ))?;
        let rows = stmt.query_map(params![session_id], prompt_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Observations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn get_observation(&self, id: i64) -> Result<ObservationRecord> {
        self.lock()
            .query_row(
                &format!("SELECT {OBSERVATION_COLS} FROM observations WHERE id = ?1"),
                params![id],
                observation_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("observation {id}")))
    }

    pub fn observations_batch(&self, ids: &[i64]) -> Result<Vec<ObservationRecord>> {
        self.batch(OBSERVATION_COLS, "observations", ids, observation_from_row)
    }

    pub fn list_observations(
        &self,
        offset: i64,
        limit: i64,
        project: Option<&str>,
    ) -> Result<Vec<ObservationRecord>> {
        self.list(
            OBSERVATION_COLS,
            "observations",
            "created_at",
            offset,
            limit,
            project,
            observation_from_row,
        )
    }

    /// All observation ids currently stored for a project. Used by the
    /// vector backfill to diff against the collection.
    pub fn observation_ids_for_project(&self, project: &str) -> Result<Vec<i64>> {
        self.ids_for_project("observations", project)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Summaries
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn get_summary(&self, id: i64) -> Result<SummaryRecord> {
        self.lock()
            .query_row(
                &format!("SELECT {SUMMARY_COLS} FROM summaries WHERE id = ?1"),
                params![id],
                summary_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("summary {id}")))
    }

    pub fn summaries_batch(&self, ids: &[i64]) -> Result<Vec<SummaryRecord>> {
        self.batch(SUMMARY_COLS, "summaries", ids, summary_from_row)
    }

    pub fn list_summaries(
        &self,
        offset: i64,
        limit: i64,
        project: Option<&str>,
    ) -> Result<Vec<SummaryRecord>> {
        self.list(SUMMARY_COLS, "summaries", "created_at", offset, limit, project, summary_from_row)
    }

    pub fn summary_ids_for_project(&self, project: &str) -> Result<Vec<i64>> {
        self.ids_for_project("summaries", project)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Projects
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Known project labels ordered by most-recent activity.
    pub fn list_projects(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT project FROM (
                 SELECT project, MAX(updated_at) AS last FROM sessions
                     WHERE project != '' GROUP BY project
                 UNION ALL
                 SELECT project, MAX(created_at) AS last FROM observations GROUP BY project
             )
             GROUP BY project ORDER BY MAX(last) DESC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // ── shared query helpers ───────────────────────────────────────

    fn batch<T>(
        &self,
        cols: &str,
        table: &str,
        ids: &[i64],
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM {table} WHERE id IN ({placeholders}) ORDER BY id"
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), map)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    #[allow(clippy::too_many_arguments)]
    fn list<T>(
        &self,
        cols: &str,
        table: &str,
        order_col: &str,
        offset: i64,
        limit: i64,
        project: Option<&str>,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let limit = limit.clamp(1, 500);
        let conn = self.lock();
        let rows = match project {
            Some(p) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {cols} FROM {table} WHERE project = ?1
                     ORDER BY {order_col} DESC, id DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(params![p, limit, offset.max(0)], map)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {cols} FROM {table}
                     ORDER BY {order_col} DESC, id DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt.query_map(params![limit, offset.max(0)], map)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    fn ids_for_project(&self, table: &str, project: &str) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT id FROM {table} WHERE project = ?1 ORDER BY id"))?;
        let rows = stmt.query_map(params![project], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SESSION_COLS: &str = "id, content_session_id, memory_session_id, project, title, \
                            first_prompt, status, created_at, updated_at";
const PROMPT_COLS: &str = "id, session_id, prompt_number, text, created_at";
pub(crate) const OBSERVATION_COLS: &str =
    "id, memory_session_id, project, kind, title, subtitle, narrative, facts, concepts, \
     files_read, files_modified, prompt_number, discovery_tokens, created_at, content_hash";
const SUMMARY_COLS: &str = "id, memory_session_id, project, request, investigated, learned, \
                            completed, next_steps, notes, discovery_tokens, created_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        content_session_id: row.get(1)?,
        memory_session_id: row.get(2)?,
        project: row.get(3)?,
        title: row.get(4)?,
        first_prompt: row.get(5)?,
        status: SessionStatus::parse(&row.get::<_, String>(6)?),
        created_at: ms_to_datetime(row.get(7)?),
        updated_at: ms_to_datetime(row.get(8)?),
    })
}

fn prompt_from_row(row: &Row<'_>) -> rusqlite::Result<UserPromptRecord> {
    Ok(UserPromptRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        prompt_number: row.get(2)?,
        text: row.get(3)?,
        created_at: ms_to_datetime(row.get(4)?),
    })
}

pub(crate) fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<ObservationRecord> {
    Ok(ObservationRecord {
        id: row.get(0)?,
        memory_session_id: row.get(1)?,
        project: row.get(2)?,
        kind: ObservationKind::parse(&row.get::<_, String>(3)?),
        title: row.get(4)?,
        subtitle: row.get(5)?,
        narrative: row.get(6)?,
        facts: json_list(row.get::<_, String>(7)?),
        concepts: json_list(row.get::<_, String>(8)?),
        files_read: json_list(row.get::<_, String>(9)?),
        files_modified: json_list(row.get::<_, String>(10)?),
        prompt_number: row.get(11)?,
        discovery_tokens: row.get(12)?,
        created_at: ms_to_datetime(row.get(13)?),
        content_hash: row.get(14)?,
    })
}

pub(crate) fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryRecord> {
    Ok(SummaryRecord {
        id: row.get(0)?,
        memory_session_id: row.get(1)?,
        project: row.get(2)?,
        request: row.get(3)?,
        investigated: row.get(4)?,
        learned: row.get(5)?,
        completed: row.get(6)?,
        next_steps: row.get(7)?,
        notes: row.get(8)?,
        discovery_tokens: row.get(9)?,
        created_at: ms_to_datetime(row.get(10)?),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn json_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

pub(crate) fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn empty_to_null(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_or_get_session_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let (id1, created1) = store
            .create_or_get_session("cs-1", "proj", "hello", None)
            .unwrap();
        let (id2, created2) = store
            .create_or_get_session("cs-1", "proj", "hello", None)
            .unwrap();
        assert_eq!(id1, id2);
        assert!(created1);
        assert!(!created2);
    }

    #[test]
    fn blank_fields_are_backfilled_on_later_calls() {
        let store = Store::open_in_memory().unwrap();
        let (id, _) = store.create_or_get_session("cs-1", "", "", None).unwrap();

        let row = store.get_session(id).unwrap();
        assert_eq!(row.project, "");
        assert!(row.first_prompt.is_none());
        assert!(row.title.is_none());

        store
            .create_or_get_session("cs-1", "proj", "first words", Some("a title"))
            .unwrap();
        let row = store.get_session(id).unwrap();
        assert_eq!(row.project, "proj");
        assert_eq!(row.first_prompt.as_deref(), Some("first words"));
        assert_eq!(row.title.as_deref(), Some("a title"));

        // A later call must not overwrite what is already there.
        store
            .create_or_get_session("cs-1", "other", "second words", Some("other title"))
            .unwrap();
        let row = store.get_session(id).unwrap();
        assert_eq!(row.project, "proj");
        assert_eq!(row.first_prompt.as_deref(), Some("first words"));
        assert_eq!(row.title.as_deref(), Some("a title"));
    }

    #[test]
    fn create_or_get_never_touches_memory_session_id() {
        let store = Store::open_in_memory().unwrap();
        let (id, _) = store.create_or_get_session("cs-1", "p", "u", None).unwrap();
        store.set_memory_session_id(id, Some("mem-1")).unwrap();

        store.create_or_get_session("cs-1", "p", "u", None).unwrap();
        let row = store.get_session(id).unwrap();
        assert_eq!(row.memory_session_id.as_deref(), Some("mem-1"));
    }

    #[test]
    fn memory_session_id_change_moves_child_rows() {
        let store = Store::open_in_memory().unwrap();
        let (id, _) = store.create_or_get_session("cs-1", "p", "u", None).unwrap();
        store.set_memory_session_id(id, Some("mem-old")).unwrap();

        // File an observation under the old memory id.
        store
            .lock()
            .execute(
                "INSERT INTO observations (memory_session_id, project, kind, created_at, content_hash)
                 VALUES ('mem-old', 'p', 'discovery', 0, 'h')",
                [],
            )
            .unwrap();

        store.set_memory_session_id(id, Some("mem-new")).unwrap();
        let count: i64 = store
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM observations WHERE memory_session_id = 'mem-new'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn prompt_numbers_increment_per_session() {
        let store = Store::open_in_memory().unwrap();
        let (a, _) = store.create_or_get_session("cs-a", "p", "u", None).unwrap();
        let (b, _) = store.create_or_get_session("cs-b", "p", "u", None).unwrap();

        assert_eq!(store.append_user_prompt(a, "one").unwrap().prompt_number, 1);
        assert_eq!(store.append_user_prompt(a, "two").unwrap().prompt_number, 2);
        assert_eq!(
            store.append_user_prompt(b, "other session").unwrap().prompt_number,
            1
        );
        assert_eq!(store.latest_prompt_number(a).unwrap(), 2);
        assert_eq!(store.latest_prompt_number(999).unwrap(), 0);

        let prompts = store.list_prompts_for_session(a).unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].text, "one");
        assert_eq!(prompts[1].text, "two");
    }

    #[test]
    fn batch_fetch_missing_ids_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        let (id, _) = store.create_or_get_session("cs-1", "p", "u", None).unwrap();
        let rows = store.sessions_batch(&[id, 999]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
    }

    #[test]
    fn projects_ordered_by_recent_activity() {
        let store = Store::open_in_memory().unwrap();
        store.create_or_get_session("cs-1", "older", "u", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create_or_get_session("cs-2", "newer", "u", None).unwrap();

        let projects = store.list_projects().unwrap();
        assert_eq!(projects, vec!["newer".to_string(), "older".to_string()]);
    }

    #[test]
    fn migrations_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("claude-mem.db");
        {
            let store = Store::open(&path).unwrap();
            store.create_or_get_session("cs-1", "p", "u", None).unwrap();
        }
        // Re-opening runs migrate() again on an up-to-date database.
        let store = Store::open(&path).unwrap();
        assert!(store.get_session_by_content_id("cs-1").unwrap().is_some());
    }

    #[test]
    fn missing_rows_map_to_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_session(42),
            Err(cm_domain::Error::NotFound(_))
        ));
        assert!(matches!(
            store.get_observation(42),
            Err(cm_domain::Error::NotFound(_))
        ));
    }
}
