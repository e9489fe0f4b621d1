//! OpenRouter adapter (REST fallback).
//!
//! Speaks the OpenAI chat-completions wire format with `Authorization:
//! Bearer` auth. Like Gemini, there is no server-side session - the full
//! truncated history travels with every call.

use std::time::Duration;

use serde_json::{json, Value};

use cm_domain::error::Result;
use cm_domain::settings::Settings;
use cm_domain::types::{Turn, TurnRole};

use crate::traits::{from_reqwest, status_error, AgentReply, CompletionRequest, MemoryAgent};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterAgent {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterAgent {
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.openrouter_api_key.clone().unwrap_or_default(),
            settings.openrouter_model.clone(),
        )
    }

    pub fn new(api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.into(),
            client,
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl MemoryAgent for OpenRouterAgent {
    fn provider_id(&self) -> &'static str {
        "openrouter"
    }

    async fn complete(&self, req: CompletionRequest<'_>) -> Result<AgentReply> {
        let body = build_body(&self.model, req.turns);
        let response = self
            .client
            .post(self.chat_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest("openrouter", e))?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| from_reqwest("openrouter", e))?;
        if !status.is_success() {
            return Err(status_error("openrouter", status.as_u16(), &payload));
        }

        parse_reply(&payload)
    }
}

fn build_body(model: &str, turns: &[Turn]) -> Value {
    let messages: Vec<Value> = turns
        .iter()
        .map(|turn| {
            json!({
                "role": match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "assistant",
                },
                "content": turn.content,
            })
        })
        .collect();
    json!({ "model": model, "messages": messages })
}

fn parse_reply(payload: &str) -> Result<AgentReply> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| cm_domain::Error::Parse(format!("openrouter response: {e}")))?;

    let text = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let usage = value.get("usage");
    Ok(AgentReply {
        text,
        provider_session_id: None,
        input_tokens: usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_includes_model_and_history() {
        let turns = vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")];
        let body = build_body("anthropic/claude-3.5-haiku", &turns);
        assert_eq!(body["model"], "anthropic/claude-3.5-haiku");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][1]["role"], "assistant");
    }

    #[test]
    fn reply_extracts_content_and_usage() {
        let reply = parse_reply(
            r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}],
                "usage":{"prompt_tokens":7,"completion_tokens":2}}"#,
        )
        .unwrap();
        assert_eq!(reply.text, "ok");
        assert_eq!(reply.total_tokens(), 9);
    }

    #[test]
    fn chat_url_is_joined_cleanly() {
        let agent = OpenRouterAgent::new("k".into(), "m".into())
            .with_base_url("http://localhost:1234/api/v1/");
        assert_eq!(agent.chat_url(), "http://localhost:1234/api/v1/chat/completions");
    }
}
