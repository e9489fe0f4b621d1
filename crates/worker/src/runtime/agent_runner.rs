//! The per-session agent loop.
//!
//! One runner owns one session's LLM conversation: it takes a concurrency
//! slot, sends the pending intro (init or continuation prompt) if any, then
//! drains the session's queue - claim, prompt, complete, process - until
//! the queue is empty, the session is aborted, or an unrecoverable error
//! leaves the in-flight rows for self-healing.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cm_domain::error::{Error, ProviderErrorKind, Result};
use cm_domain::types::{MessageKind, PendingMessage, Turn};
use cm_providers::{AgentReply, CompletionRequest, MemoryAgent};
use cm_storage::db::ms_to_datetime;

use super::session_manager::ActiveSession;
use super::{processor, prompts, truncate, Runtime};

pub async fn run(runtime: Arc<Runtime>, session: Arc<ActiveSession>) {
    let slot_wait = Duration::from_millis(runtime.settings.slot_wait_ms);
    let _slot = match runtime.registry.acquire_slot(slot_wait).await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(
                session_db_id = session.session_db_id,
                error = %e,
                "no agent slot available, generator exiting"
            );
            return;
        }
    };

    tracing::debug!(session_db_id = session.session_db_id, "agent runner started");

    // Intro turn (init prompt on a fresh conversation, continuation on a
    // resumed one). Its reply establishes the memory session id.
    let intro = session.pending_intro.lock().take();
    if let Some(intro) = intro {
        session.history.lock().push(Turn::user(intro));
        match complete_with_fallback(&runtime, &session).await {
            Ok(None) => return,
            Ok(Some(reply)) => {
                if let Err(e) = note_reply(&runtime, &session, &reply) {
                    tracing::error!(
                        session_db_id = session.session_db_id,
                        error = %e,
                        "failed to establish memory session id"
                    );
                    return;
                }
                if !reply.text.trim().is_empty() {
                    if let Err(e) = processor::process_response(&runtime, &session, &reply).await {
                        tracing::error!(
                            session_db_id = session.session_db_id,
                            error = %e,
                            "intro reply processing failed"
                        );
                        return;
                    }
                } else {
                    session
                        .history
                        .lock()
                        .push(Turn::assistant(String::new()));
                }
            }
            Err(e) => {
                tracing::error!(
                    session_db_id = session.session_db_id,
                    error = %e,
                    "intro completion failed, generator exiting"
                );
                return;
            }
        }
    }

    // Claim-next loop.
    loop {
        if session.cancel.is_cancelled() {
            tracing::debug!(session_db_id = session.session_db_id, "runner aborted");
            break;
        }

        let message = match runtime.queue.claim_next(session.session_db_id) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(
                    session_db_id = session.session_db_id,
                    "queue drained, generator exiting"
                );
                break;
            }
            Err(e) => {
                tracing::error!(
                    session_db_id = session.session_db_id,
                    error = %e,
                    "claim failed, generator exiting"
                );
                break;
            }
        };

        record_claim(&session, &message);
        let prompt = prompt_for(&message);
        session.history.lock().push(Turn::user(prompt));

        match complete_with_fallback(&runtime, &session).await {
            // Cancelled mid-call: the row stays `processing` and is
            // recovered by self-healing on the next run.
            Ok(None) => break,
            Ok(Some(reply)) => {
                if let Err(e) = note_reply(&runtime, &session, &reply) {
                    tracing::error!(
                        session_db_id = session.session_db_id,
                        error = %e,
                        "memory session bookkeeping failed"
                    );
                    break;
                }
                if reply.text.trim().is_empty() {
                    // The model declined this input: soft failure, bounded
                    // retries via the queue.
                    soft_fail(&runtime, &session, message.id);
                    continue;
                }
                if let Err(e) = processor::process_response(&runtime, &session, &reply).await {
                    tracing::error!(
                        session_db_id = session.session_db_id,
                        message_id = message.id,
                        error = %e,
                        "reply processing failed, leaving batch for recovery"
                    );
                    break;
                }
                session.touch();
            }
            Err(e) if is_input_rejection(&e) => {
                tracing::warn!(
                    session_db_id = session.session_db_id,
                    message_id = message.id,
                    error = %e,
                    "provider rejected the input"
                );
                soft_fail(&runtime, &session, message.id);
            }
            Err(e) => {
                // Transport-class failure with no fallback left: leave the
                // row `processing` for self-heal and stop this generator.
                tracing::error!(
                    session_db_id = session.session_db_id,
                    message_id = message.id,
                    error = %e,
                    "completion failed, generator exiting"
                );
                break;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Completion with provider fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Call the session's active provider; on a fallback-eligible failure hand
/// the same session (history included) to the fallback agent once.
/// `Ok(None)` means the session was cancelled mid-call.
async fn complete_with_fallback(
    runtime: &Runtime,
    session: &ActiveSession,
) -> Result<Option<AgentReply>> {
    let provider = active_provider(runtime, session);

    match complete_once(runtime, session, provider.as_ref()).await? {
        CallOutcome::Cancelled => Ok(None),
        CallOutcome::Reply(reply) => Ok(Some(reply)),
        CallOutcome::Failed(e) => {
            let fallback = runtime
                .fallback
                .as_ref()
                .filter(|_| e.is_fallback_eligible())
                .filter(|fb| fb.provider_id() != provider.provider_id());
            let Some(fallback) = fallback else {
                return Err(e);
            };

            tracing::warn!(
                session_db_id = session.session_db_id,
                from = provider.provider_id(),
                to = fallback.provider_id(),
                error = %e,
                "provider failed, falling back"
            );
            *session.active_provider.lock() = fallback.provider_id().to_owned();

            match complete_once(runtime, session, fallback.as_ref()).await? {
                CallOutcome::Cancelled => Ok(None),
                CallOutcome::Reply(reply) => Ok(Some(reply)),
                CallOutcome::Failed(e) => Err(e),
            }
        }
    }
}

enum CallOutcome {
    Reply(AgentReply),
    Failed(Error),
    Cancelled,
}

async fn complete_once(
    runtime: &Runtime,
    session: &ActiveSession,
    provider: &dyn MemoryAgent,
) -> Result<CallOutcome> {
    let turns: Vec<Turn> = {
        let history = session.history.lock();
        truncate::truncate_history(
            &history,
            runtime.settings.max_history_messages,
            runtime.settings.max_history_tokens,
        )
        .to_vec()
    };
    let resume = session.resume_session_id.lock().clone();
    let cwd = session.cwd.lock().clone().map(PathBuf::from);

    let request = CompletionRequest {
        session_db_id: session.session_db_id,
        turns: &turns,
        resume_session_id: resume.as_deref(),
        cwd: cwd.as_deref(),
    };

    tokio::select! {
        _ = session.cancel.cancelled() => Ok(CallOutcome::Cancelled),
        result = provider.complete(request) => match result {
            Ok(reply) => Ok(CallOutcome::Reply(reply)),
            Err(e) => Ok(CallOutcome::Failed(e)),
        },
    }
}

fn active_provider(runtime: &Runtime, session: &ActiveSession) -> Arc<dyn MemoryAgent> {
    let active = session.active_provider.lock().clone();
    match &runtime.fallback {
        Some(fallback) if fallback.provider_id() == active => fallback.clone(),
        _ => runtime.primary.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn record_claim(session: &ActiveSession, message: &PendingMessage) {
    session.in_flight.lock().push(message.id);
    {
        let mut earliest = session.earliest_pending_ms.lock();
        *earliest = Some(match *earliest {
            Some(existing) => existing.min(message.created_at_ms),
            None => message.created_at_ms,
        });
    }
    if let Some(dir) = &message.cwd {
        *session.cwd.lock() = Some(dir.clone());
    }
}

fn prompt_for(message: &PendingMessage) -> String {
    match message.kind {
        MessageKind::Observation => prompts::observation_prompt(
            message.tool_name.as_deref().unwrap_or("unknown"),
            message.tool_input.as_deref(),
            message.tool_response.as_deref(),
            ms_to_datetime(message.created_at_ms),
            message.cwd.as_deref(),
        ),
        MessageKind::Summarize => {
            prompts::summary_prompt(message.last_assistant_message.as_deref())
        }
    }
}

/// Track provider bookkeeping after every successful reply: the resume id,
/// token spend, and (once) the memory session id. The memory id must never
/// equal the content id - a provider echoing it gets replaced by a local
/// UUID.
fn note_reply(runtime: &Runtime, session: &ActiveSession, reply: &AgentReply) -> Result<()> {
    if let Some(provider_sid) = &reply.provider_session_id {
        *session.resume_session_id.lock() = Some(provider_sid.clone());
    }
    session
        .tokens_spent
        .fetch_add(reply.total_tokens(), Ordering::Relaxed);

    if session.memory_session_id.lock().is_some() {
        return Ok(());
    }
    let memory_id = reply
        .provider_session_id
        .clone()
        .filter(|sid| sid != &session.content_session_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    runtime
        .store
        .set_memory_session_id(session.session_db_id, Some(&memory_id))?;
    *session.memory_session_id.lock() = Some(memory_id);
    Ok(())
}

fn soft_fail(runtime: &Runtime, session: &ActiveSession, message_id: i64) {
    session.in_flight.lock().retain(|id| *id != message_id);
    if let Err(e) = runtime.queue.mark_failed(message_id) {
        tracing::warn!(message_id, error = %e, "mark_failed failed");
    }
}

/// A rejection of the input itself, as opposed to a transport-class
/// failure: retried through the queue, never through self-healing.
fn is_input_rejection(e: &Error) -> bool {
    matches!(
        e,
        Error::Parse(_)
            | Error::Provider {
                kind: ProviderErrorKind::InvalidRequest,
                ..
            }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_rejections_are_soft() {
        assert!(is_input_rejection(&Error::Parse("bad tags".into())));
        assert!(is_input_rejection(&Error::Provider {
            provider: "gemini".into(),
            kind: ProviderErrorKind::InvalidRequest,
            message: "schema".into(),
        }));
        assert!(!is_input_rejection(&Error::Timeout("60s".into())));
        assert!(!is_input_rejection(&Error::Provider {
            provider: "gemini".into(),
            kind: ProviderErrorKind::Server,
            message: "503".into(),
        }));
    }
}
