//! Response processing: one LLM reply in, durable rows out.
//!
//! Ordering matters. Anything that fails before the storage transaction
//! leaves the claimed queue rows `processing` (self-heal recovers them); a
//! storage failure rolls the whole batch back with the queue untouched;
//! everything after the commit is best-effort fan-out and never fails the
//! processor.

use std::collections::HashSet;

use cm_domain::error::{Error, Result};
use cm_domain::types::Turn;
use cm_providers::AgentReply;
use cm_storage::transactions;

use super::events::WorkerEvent;
use super::parser;
use super::session_manager::ActiveSession;
use super::Runtime;

/// Outcome of one processed reply.
#[derive(Debug, Default)]
pub struct ProcessedBatch {
    pub observation_ids: Vec<i64>,
    pub summary_id: Option<i64>,
    pub confirmed_messages: usize,
}

pub async fn process_response(
    runtime: &Runtime,
    session: &ActiveSession,
    reply: &AgentReply,
) -> Result<ProcessedBatch> {
    // 1. The reply joins the conversation history first, so a storage
    //    failure does not lose the assistant turn on retry.
    session
        .history
        .lock()
        .push(Turn::assistant(reply.text.clone()));

    // 2. Parse.
    let parsed = parser::parse_response(&reply.text);

    // 3. Without a memory session id there is nowhere to file the batch.
    let memory_session_id = session
        .memory_session_id
        .lock()
        .clone()
        .ok_or_else(|| {
            Error::Other(format!(
                "no memory session id for session {}, cannot store batch",
                session.session_db_id
            ))
        })?;

    // 4. Atomic commit, backdated to when the event was captured.
    let override_ts = *session.earliest_pending_ms.lock();
    let prompt_number = session
        .last_prompt_number
        .load(std::sync::atomic::Ordering::Relaxed);
    let batch = transactions::store_observations(
        &runtime.store,
        &memory_session_id,
        &session.project,
        &parsed.observations,
        parsed.summary.as_ref(),
        (prompt_number > 0).then_some(prompt_number),
        reply.total_tokens() as i64,
        override_ts,
    )?;

    // 5. Confirm every in-flight message for the batch.
    let in_flight: Vec<i64> = std::mem::take(&mut *session.in_flight.lock());
    *session.earliest_pending_ms.lock() = None;
    for message_id in &in_flight {
        runtime.queue.confirm(*message_id)?;
    }

    // 6. Fan out. Several drafts may have deduplicated onto one row.
    let mut seen = HashSet::new();
    let mut folder_paths: HashSet<String> = HashSet::new();
    for observation_id in &batch.observation_ids {
        if !seen.insert(*observation_id) {
            continue;
        }
        match runtime.store.get_observation(*observation_id) {
            Ok(record) => {
                runtime.events.publish(WorkerEvent::Observation {
                    id: record.id,
                    project: record.project.clone(),
                    kind: record.kind.as_str().to_owned(),
                    title: record.title.clone(),
                });
                folder_paths.extend(record.files_read.iter().cloned());
                folder_paths.extend(record.files_modified.iter().cloned());
                let vector = runtime.vector.clone();
                tokio::spawn(async move {
                    vector.sync_observation(&record).await;
                });
            }
            Err(e) => {
                tracing::warn!(observation_id, error = %e, "stored observation fetch failed")
            }
        }
    }
    if let Some(summary_id) = batch.summary_id {
        match runtime.store.get_summary(summary_id) {
            Ok(record) => {
                runtime.events.publish(WorkerEvent::Summary {
                    id: record.id,
                    project: record.project.clone(),
                    request: record.request.clone(),
                });
                let vector = runtime.vector.clone();
                tokio::spawn(async move {
                    vector.sync_summary(&record).await;
                });
            }
            Err(e) => tracing::warn!(summary_id, error = %e, "stored summary fetch failed"),
        }
    }

    // 7. Folder-index updates are consumed externally; just surface the
    //    touched paths when the feature is on.
    if runtime.settings.folder_claudemd_enabled && !folder_paths.is_empty() {
        tracing::debug!(
            session_db_id = session.session_db_id,
            paths = folder_paths.len(),
            "folder index update queued for touched files"
        );
    }

    Ok(ProcessedBatch {
        observation_ids: batch.observation_ids,
        summary_id: batch.summary_id,
        confirmed_messages: in_flight.len(),
    })
}
