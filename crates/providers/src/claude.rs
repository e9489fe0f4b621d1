//! Claude CLI subprocess agent (primary).
//!
//! Each turn spawns `claude -p --output-format json`, writes the prompt to
//! stdin, and parses the single JSON object the CLI prints. Conversation
//! continuity is server-side: the CLI returns a `session_id`, and later
//! turns pass it back via `--resume`, so only the newest user turn is sent.
//!
//! Child PIDs are registered with the [`ProcessRegistry`] for the whole
//! lifetime of the call, so the reaper can find them if this task dies.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use cm_domain::error::{Error, ProviderErrorKind, Result};
use cm_domain::types::TurnRole;
use cm_process::{spawn_captured, ProcessRegistry};

use crate::traits::{AgentReply, CompletionRequest, MemoryAgent};

#[cfg(windows)]
const CLI_PROGRAM: &str = "claude.cmd";
#[cfg(not(windows))]
const CLI_PROGRAM: &str = "claude";

/// Generous ceiling - the CLI call includes model time.
const CALL_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ClaudeAgent {
    registry: Arc<ProcessRegistry>,
    model: Option<String>,
}

impl ClaudeAgent {
    pub fn new(registry: Arc<ProcessRegistry>, model: Option<String>) -> Self {
        Self { registry, model }
    }

    async fn run_cli(&self, req: &CompletionRequest<'_>, prompt: &str) -> Result<AgentReply> {
        let mut args: Vec<&str> = vec!["-p", "--output-format", "json"];
        if let Some(model) = self.model.as_deref() {
            args.push("--model");
            args.push(model);
        }
        if let Some(resume) = req.resume_session_id {
            args.push("--resume");
            args.push(resume);
        }

        let (mut child, pid) = spawn_captured(CLI_PROGRAM, &args, req.cwd).map_err(|e| {
            Error::Provider {
                provider: "claude".into(),
                kind: ProviderErrorKind::Transport,
                message: e.to_string(),
            }
        })?;
        self.registry.register(pid, req.session_db_id);

        let outcome = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Provider {
                    provider: "claude".into(),
                    kind: classify_cli_failure(&stderr),
                    message: format!(
                        "exit {}: {}",
                        output.status.code().unwrap_or(-1),
                        stderr.trim()
                    ),
                });
            }
            parse_cli_reply(&String::from_utf8_lossy(&output.stdout))
        };

        let result = tokio::time::timeout(CALL_TIMEOUT, outcome).await;
        self.registry.unregister(pid);
        match result {
            Ok(reply) => reply,
            Err(_) => {
                cm_process::spawn::kill_pid(pid);
                Err(Error::Timeout(format!(
                    "claude CLI call exceeded {}s",
                    CALL_TIMEOUT.as_secs()
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl MemoryAgent for ClaudeAgent {
    fn provider_id(&self) -> &'static str {
        "claude"
    }

    async fn complete(&self, req: CompletionRequest<'_>) -> Result<AgentReply> {
        let prompt = latest_user_prompt(&req).ok_or_else(|| {
            Error::Other("completion requested with no user turn".into())
        })?;
        self.run_cli(&req, &prompt).await
    }
}

/// The newest user turn. The CLI resumes its own history, so older turns
/// are not re-sent.
fn latest_user_prompt(req: &CompletionRequest<'_>) -> Option<String> {
    req.turns
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::User)
        .map(|t| t.content.clone())
}

/// Parse the CLI's `--output-format json` object.
fn parse_cli_reply(stdout: &str) -> Result<AgentReply> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| Error::Parse(format!("claude CLI output: {e}")))?;
    let text = value
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let provider_session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let usage = value.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(AgentReply {
        text,
        provider_session_id,
        input_tokens,
        output_tokens,
    })
}

/// Best-effort classification of a nonzero CLI exit from its stderr.
fn classify_cli_failure(stderr: &str) -> ProviderErrorKind {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("unauthorized")
        || lowered.contains("authentication")
        || lowered.contains("not logged in")
        || lowered.contains("401")
    {
        ProviderErrorKind::Auth
    } else if lowered.contains("rate limit") || lowered.contains("429") {
        ProviderErrorKind::RateLimited
    } else if lowered.contains("overloaded") || lowered.contains("529") || lowered.contains("500")
    {
        ProviderErrorKind::Server
    } else {
        ProviderErrorKind::Transport
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
