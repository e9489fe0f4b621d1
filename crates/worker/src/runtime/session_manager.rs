//! In-memory map of active sessions and their generator tasks.
//!
//! One [`ActiveSession`] per session currently being serviced; its
//! generator task runs the agent loop and exits when the queue drains.
//! `ensure_started` is idempotent and reports whether a live generator
//! already existed - the re-injection guard hook clients rely on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cm_domain::error::Result;
use cm_domain::types::{NewPendingMessage, SessionRecord, SessionStatus, Turn};
use cm_process::spawn::kill_pid;

use super::events::WorkerEvent;
use super::{agent_runner, prompts, Runtime};

/// How long `delete_session` waits for a generator before aborting it.
const GENERATOR_EXIT_DEADLINE: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ActiveSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime-only state for a session being serviced. Owned exclusively by
/// the [`SessionManager`]; the conversation history is touched only by the
/// session's own runner.
pub struct ActiveSession {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub project: String,
    pub memory_session_id: Mutex<Option<String>>,
    /// Provider-side conversation id to resume (Claude CLI).
    pub resume_session_id: Mutex<Option<String>>,
    pub history: Mutex<Vec<Turn>>,
    /// Queue row ids claimed but not yet confirmed.
    pub in_flight: Mutex<Vec<i64>>,
    /// Capture time of the oldest unconfirmed message - stored rows get
    /// this timestamp, not the LLM completion time.
    pub earliest_pending_ms: Mutex<Option<i64>>,
    pub cwd: Mutex<Option<String>>,
    /// Init or continuation prompt waiting to open the next generator run.
    pub pending_intro: Mutex<Option<String>>,
    pub active_provider: Mutex<String>,
    pub last_prompt_number: AtomicI64,
    pub tokens_spent: AtomicU64,
    pub last_activity_ms: AtomicI64,
    pub cancel: CancellationToken,
}

impl ActiveSession {
    fn from_record(record: &SessionRecord, primary_provider: &str) -> Self {
        Self {
            session_db_id: record.id,
            content_session_id: record.content_session_id.clone(),
            project: record.project.clone(),
            memory_session_id: Mutex::new(record.memory_session_id.clone()),
            resume_session_id: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            earliest_pending_ms: Mutex::new(None),
            cwd: Mutex::new(None),
            pending_intro: Mutex::new(None),
            active_provider: Mutex::new(primary_provider.to_owned()),
            last_prompt_number: AtomicI64::new(0),
            tokens_spent: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Result of `ensure_started`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureStarted {
    pub session_db_id: i64,
    pub prompt_number: i64,
    /// True iff a live generator already existed - the hook must not
    /// re-inject context into the IDE surface.
    pub context_injected: bool,
    pub created: bool,
}

struct Entry {
    session: Arc<ActiveSession>,
    generator: JoinHandle<()>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    runtime: Arc<Runtime>,
    sessions: Mutex<HashMap<i64, Entry>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Get-or-create the session row, record the prompt, and make sure a
    /// generator services the session.
    pub fn ensure_started(
        &self,
        content_session_id: &str,
        project: &str,
        user_prompt: &str,
        cwd: Option<&str>,
    ) -> Result<EnsureStarted> {
        let project = resolve_project(project, cwd);
        let (session_db_id, created) = self.runtime.store.create_or_get_session(
            content_session_id,
            &project,
            user_prompt,
            None,
        )?;

        // Multi-terminal re-entry: a known, still-active session with no
        // live generator gets a fresh memory thread. The cached
        // ActiveSession (kept for conversation continuity) must forget the
        // old thread too, or the next reply would skip re-establishment
        // and keep filing rows under the stale id.
        if !created && !self.has_live_generator(session_db_id) {
            let row = self.runtime.store.get_session(session_db_id)?;
            if row.status == SessionStatus::Active && row.memory_session_id.is_some() {
                tracing::info!(
                    session_db_id,
                    "session re-entered without a live generator, resetting memory thread"
                );
                self.runtime
                    .store
                    .set_memory_session_id(session_db_id, None)?;
                if let Some(entry) = self.sessions.lock().get(&session_db_id) {
                    *entry.session.memory_session_id.lock() = None;
                    *entry.session.resume_session_id.lock() = None;
                }
            }
        }

        let prompt_number = if user_prompt.is_empty() {
            self.runtime.store.latest_prompt_number(session_db_id)?
        } else {
            let record = self
                .runtime
                .store
                .append_user_prompt(session_db_id, user_prompt)?;
            let vector = self.runtime.vector.clone();
            let project_for_sync = project.clone();
            let prompt_record = record.clone();
            tokio::spawn(async move {
                vector
                    .sync_user_prompt(&project_for_sync, &prompt_record)
                    .await;
            });
            record.prompt_number
        };

        let mut sessions = self.sessions.lock();
        let live = sessions
            .get(&session_db_id)
            .map(|e| !e.generator.is_finished())
            .unwrap_or(false);

        if live {
            if let Some(entry) = sessions.get(&session_db_id) {
                entry
                    .session
                    .last_prompt_number
                    .store(prompt_number, Ordering::Relaxed);
                entry.session.touch();
            }
            return Ok(EnsureStarted {
                session_db_id,
                prompt_number,
                context_injected: true,
                created,
            });
        }

        let row = self.runtime.store.get_session(session_db_id)?;
        let session = self.session_entry(&mut sessions, &row);
        session
            .last_prompt_number
            .store(prompt_number, Ordering::Relaxed);
        if let Some(dir) = cwd {
            *session.cwd.lock() = Some(dir.to_owned());
        }

        let intro = if session.history.lock().is_empty() {
            Some(prompts::init_prompt(
                &project,
                content_session_id,
                user_prompt,
            ))
        } else if !user_prompt.is_empty() {
            Some(prompts::continuation_prompt(user_prompt, prompt_number))
        } else {
            None
        };
        *session.pending_intro.lock() = intro;

        self.spawn_generator(&mut sessions, session);
        self.runtime.events.publish(WorkerEvent::SessionStart {
            session_db_id,
            content_session_id: content_session_id.to_owned(),
            project,
        });

        Ok(EnsureStarted {
            session_db_id,
            prompt_number,
            context_injected: false,
            created,
        })
    }

    /// Forward a message to the queue and make sure a generator is running.
    pub fn enqueue(&self, session_db_id: i64, message: &NewPendingMessage) -> Result<i64> {
        let row = self.runtime.store.get_session(session_db_id)?;
        let message_id =
            self.runtime
                .queue
                .enqueue(session_db_id, &row.content_session_id, message)?;

        self.kick(&row);
        self.publish_processing_status();
        Ok(message_id)
    }

    /// Make sure a generator services `row`, spawning one if needed.
    pub fn kick(&self, row: &SessionRecord) {
        let mut sessions = self.sessions.lock();
        let live = sessions
            .get(&row.id)
            .map(|e| !e.generator.is_finished())
            .unwrap_or(false);
        if live {
            return;
        }
        let session = self.session_entry(&mut sessions, row);
        self.spawn_generator(&mut sessions, session);
    }

    /// Spawn generators for every session with pending work.
    pub fn kick_all_pending(&self) -> Result<usize> {
        let session_ids = self.runtime.queue.get_sessions_with_pending_messages()?;
        let mut kicked = 0;
        for session_id in session_ids {
            let row = self.runtime.store.get_session(session_id)?;
            self.kick(&row);
            kicked += 1;
        }
        Ok(kicked)
    }

    /// Abort the generator, wait for it (bounded), kill any lingering
    /// registered subprocess, and drop the in-memory state.
    pub async fn delete_session(&self, session_db_id: i64) -> Result<()> {
        let entry = self.sessions.lock().remove(&session_db_id);
        if let Some(entry) = entry {
            entry.session.cancel.cancel();
            let mut generator = entry.generator;
            if tokio::time::timeout(GENERATOR_EXIT_DEADLINE, &mut generator)
                .await
                .is_err()
            {
                tracing::warn!(session_db_id, "generator missed exit deadline, aborting");
                generator.abort();
            }

            for pid in self.runtime.registry.pids_for_session(session_db_id) {
                tracing::info!(pid, session_db_id, "killing lingering session subprocess");
                kill_pid(pid);
                self.runtime.registry.unregister(pid);
            }

            self.runtime.events.publish(WorkerEvent::SessionEnd {
                session_db_id,
                content_session_id: entry.session.content_session_id.clone(),
            });
        }

        self.runtime.store.mark_session_ended(session_db_id)?;
        self.publish_processing_status();
        Ok(())
    }

    /// Abort every active session (shutdown path).
    pub async fn shutdown_all(&self) {
        let ids: Vec<i64> = self.sessions.lock().keys().copied().collect();
        for session_db_id in ids {
            if let Err(e) = self.delete_session(session_db_id).await {
                tracing::warn!(session_db_id, error = %e, "session abort during shutdown failed");
            }
        }
    }

    /// Sum of queue depths across active sessions.
    pub fn get_total_active_work(&self) -> i64 {
        let ids: Vec<i64> = self.sessions.lock().keys().copied().collect();
        ids.iter()
            .map(|id| self.runtime.queue.depth(*id).unwrap_or(0))
            .sum()
    }

    pub fn active_session_ids(&self) -> Vec<i64> {
        self.sessions.lock().keys().copied().collect()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_live_generator(&self, session_db_id: i64) -> bool {
        self.sessions
            .lock()
            .get(&session_db_id)
            .map(|e| !e.generator.is_finished())
            .unwrap_or(false)
    }

    pub fn publish_processing_status(&self) {
        self.runtime.events.publish(WorkerEvent::ProcessingStatus {
            active_sessions: self.active_session_count(),
            queued: self.get_total_active_work(),
        });
    }

    // ── internals ──────────────────────────────────────────────────

    /// The existing ActiveSession for this row, or a fresh one. Reusing the
    /// existing state preserves conversation history across generator runs.
    fn session_entry(
        &self,
        sessions: &mut HashMap<i64, Entry>,
        row: &SessionRecord,
    ) -> Arc<ActiveSession> {
        match sessions.get(&row.id) {
            Some(entry) => entry.session.clone(),
            None => Arc::new(ActiveSession::from_record(
                row,
                self.runtime.primary.provider_id(),
            )),
        }
    }

    fn spawn_generator(&self, sessions: &mut HashMap<i64, Entry>, session: Arc<ActiveSession>) {
        let runtime = self.runtime.clone();
        let task_session = session.clone();
        let generator = tokio::spawn(async move {
            agent_runner::run(runtime, task_session).await;
        });
        sessions.insert(session.session_db_id, Entry { session, generator });
    }
}

/// Derive a project label from the working directory when none was given.
fn resolve_project(project: &str, cwd: Option<&str>) -> String {
    if !project.is_empty() {
        return project.to_owned();
    }
    cwd.and_then(|dir| {
        std::path::Path::new(dir)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    })
    .unwrap_or_default()
}
