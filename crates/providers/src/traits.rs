use std::path::Path;

use cm_domain::error::{Error, Result};
use cm_domain::types::Turn;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Reply types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One completion request against a provider.
///
/// `turns` is the already-truncated conversation, newest last; the final
/// turn is the user message awaiting an answer. The subprocess agent may
/// ignore older turns and rely on `resume_session_id` instead - its CLI
/// keeps the conversation server-side.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub session_db_id: i64,
    pub turns: &'a [Turn],
    pub resume_session_id: Option<&'a str>,
    pub cwd: Option<&'a Path>,
}

/// A provider reply.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub text: String,
    /// Provider-side conversation id, when the provider has one. Used to
    /// establish the memory session id on the first reply.
    pub provider_session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AgentReply {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Contract shared by the Claude CLI, Gemini, and OpenRouter agents.
#[async_trait::async_trait]
pub trait MemoryAgent: Send + Sync {
    /// Stable identifier (`"claude"`, `"gemini"`, `"openrouter"`).
    fn provider_id(&self) -> &'static str;

    /// Send one completion request and wait for the full reply.
    async fn complete(&self, req: CompletionRequest<'_>) -> Result<AgentReply>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a reqwest failure into the domain error taxonomy.
pub(crate) fn from_reqwest(provider: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::Timeout(format!("{provider}: {e}"));
    }
    if e.is_connect() || e.is_request() {
        return Error::Provider {
            provider: provider.to_owned(),
            kind: cm_domain::ProviderErrorKind::Transport,
            message: e.to_string(),
        };
    }
    Error::Http(e.to_string())
}

/// Build a provider error from a non-success HTTP status.
pub(crate) fn status_error(provider: &str, status: u16, body: &str) -> Error {
    Error::Provider {
        provider: provider.to_owned(),
        kind: Error::provider_kind_for_status(status),
        message: format!("HTTP {status}: {body}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_classify_for_fallback() {
        assert!(status_error("gemini", 429, "slow down").is_fallback_eligible());
        assert!(status_error("gemini", 503, "overloaded").is_fallback_eligible());
        assert!(status_error("gemini", 401, "bad key").is_fallback_eligible());
        assert!(!status_error("gemini", 400, "bad request").is_fallback_eligible());
    }
}
