//! Google Gemini adapter (REST fallback).
//!
//! Implements the `generateContent` API. Auth is an API key passed as a
//! query parameter. The full (truncated) conversation is serialized into
//! `contents` on every call - Gemini keeps no server-side session, so the
//! memory session id for Gemini-backed sessions is minted locally.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use cm_domain::error::Result;
use cm_domain::settings::Settings;
use cm_domain::types::{Turn, TurnRole};

use crate::traits::{from_reqwest, status_error, AgentReply, CompletionRequest, MemoryAgent};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Minimum spacing between calls when client-side pacing is enabled
/// (free-tier quotas are per-minute).
const PACED_INTERVAL: Duration = Duration::from_secs(6);

pub struct GeminiAgent {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    /// `Some` when `CLAUDE_MEM_GEMINI_RATE_LIMITED` pacing is on.
    pacing: Option<tokio::sync::Mutex<Option<Instant>>>,
}

impl GeminiAgent {
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.gemini_api_key.clone().unwrap_or_default(),
            settings.gemini_model.clone(),
            settings.gemini_rate_limited,
        )
    }

    pub fn new(api_key: String, model: String, paced: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.into(),
            client,
            pacing: paced.then(|| tokio::sync::Mutex::new(None)),
        }
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    async fn pace(&self) {
        let Some(gate) = &self.pacing else { return };
        let mut last = gate.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < PACED_INTERVAL {
                tokio::time::sleep(PACED_INTERVAL - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait::async_trait]
impl MemoryAgent for GeminiAgent {
    fn provider_id(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, req: CompletionRequest<'_>) -> Result<AgentReply> {
        self.pace().await;

        let body = build_body(req.turns);
        let response = self
            .client
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest("gemini", e))?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| from_reqwest("gemini", e))?;
        if !status.is_success() {
            return Err(status_error("gemini", status.as_u16(), &payload));
        }

        parse_reply(&payload)
    }
}

fn build_body(turns: &[Turn]) -> Value {
    let contents: Vec<Value> = turns
        .iter()
        .map(|turn| {
            json!({
                "role": match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "model",
                },
                "parts": [{ "text": turn.content }],
            })
        })
        .collect();
    json!({ "contents": contents })
}

fn parse_reply(payload: &str) -> Result<AgentReply> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| cm_domain::Error::Parse(format!("gemini response: {e}")))?;

    let text = value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = value.get("usageMetadata");
    Ok(AgentReply {
        text,
        provider_session_id: None,
        input_tokens: usage
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: usage
            .and_then(|u| u.get("candidatesTokenCount"))
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
    fn body_maps_roles_to_gemini_names() {
        let turns = vec![Turn::user("hello"), Turn::assistant("hi there")];
        let body = build_body(&turns);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "hi there");
    }

    #[test]
    fn reply_text_joins_all_parts() {
        let reply = parse_reply(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"<observation>"},{"text":"</observation>"}
            ]}}],
            "usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5}}"#,
        )
        .unwrap();
        assert_eq!(reply.text, "<observation></observation>");
        assert_eq!(reply.input_tokens, 10);
        assert_eq!(reply.output_tokens, 5);
        assert!(reply.provider_session_id.is_none());
    }

    #[test]
    fn empty_candidates_yield_empty_text() {
        let reply = parse_reply(r#"{"candidates":[]}"#).unwrap();
        assert!(reply.text.is_empty());
    }

    #[test]
    fn url_embeds_model_and_key() {
        let agent = GeminiAgent::new("secret".into(), "gemini-2.0-flash".into(), false)
            .with_base_url("http://localhost:9999/");
        assert_eq!(
            agent.generate_url(),
            "http://localhost:9999/v1beta/models/gemini-2.0-flash:generateContent?key=secret"
        );
    }

    #[tokio::test]
    async fn pacing_disabled_does_not_sleep() {
        let agent = GeminiAgent::new("k".into(), "m".into(), false);
        let start = Instant::now();
        agent.pace().await;
        agent.pace().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
