//! LLM provider adapters.
//!
//! Three agents share the [`traits::MemoryAgent`] contract: the Claude CLI
//! subprocess agent (primary, subscription-backed), Gemini REST, and
//! OpenRouter REST. Only one is active per session; when the active agent
//! fails with a fallback-eligible error the runner hands the same session
//! (conversation history included) to the next one.

pub mod claude;
pub mod gemini;
pub mod openrouter;
pub mod traits;

use std::sync::Arc;

use cm_domain::settings::{ProviderKind, Settings};
use cm_process::ProcessRegistry;

pub use traits::{AgentReply, CompletionRequest, MemoryAgent};

/// Build the (primary, fallback) agent pair from settings.
///
/// The configured provider is primary. The fallback chain prefers Gemini,
/// then OpenRouter, skipping providers without credentials and the primary
/// itself. The Claude CLI agent needs no API key.
pub fn build_agents(
    settings: &Settings,
    registry: Arc<ProcessRegistry>,
) -> (Arc<dyn MemoryAgent>, Option<Arc<dyn MemoryAgent>>) {
    let primary: Arc<dyn MemoryAgent> = match settings.provider {
        ProviderKind::Claude => Arc::new(claude::ClaudeAgent::new(
            registry,
            settings.claude_model.clone(),
        )),
        ProviderKind::Gemini => Arc::new(gemini::GeminiAgent::from_settings(settings)),
        ProviderKind::Openrouter => Arc::new(openrouter::OpenRouterAgent::from_settings(settings)),
    };

    let mut fallback: Option<Arc<dyn MemoryAgent>> = None;
    if settings.provider != ProviderKind::Gemini && settings.gemini_api_key.is_some() {
        fallback = Some(Arc::new(gemini::GeminiAgent::from_settings(settings)));
    } else if settings.provider != ProviderKind::Openrouter
        && settings.openrouter_api_key.is_some()
    {
        fallback = Some(Arc::new(openrouter::OpenRouterAgent::from_settings(
            settings,
        )));
    }

    (primary, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_domain::paths::DataDir;

    fn settings_with(json: &str) -> Settings {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().to_path_buf());
        std::fs::write(dd.settings_path(), json).unwrap();
        Settings::load_from(dd).unwrap()
    }

    #[test]
    fn claude_primary_with_gemini_fallback() {
        let settings =
            settings_with(r#"{"CLAUDE_MEM_GEMINI_API_KEY": "k"}"#);
        let registry = Arc::new(ProcessRegistry::new(2));
        let (primary, fallback) = build_agents(&settings, registry);
        assert_eq!(primary.provider_id(), "claude");
        assert_eq!(fallback.unwrap().provider_id(), "gemini");
    }

    #[test]
    fn no_credentials_means_no_fallback() {
        let settings = settings_with("{}");
        let registry = Arc::new(ProcessRegistry::new(2));
        let (primary, fallback) = build_agents(&settings, registry);
        assert_eq!(primary.provider_id(), "claude");
        assert!(fallback.is_none());
    }

    #[test]
    fn gemini_primary_falls_back_to_openrouter() {
        let settings = settings_with(
            r#"{
                "CLAUDE_MEM_PROVIDER": "gemini",
                "CLAUDE_MEM_GEMINI_API_KEY": "g",
                "CLAUDE_MEM_OPENROUTER_API_KEY": "o"
            }"#,
        );
        let registry = Arc::new(ProcessRegistry::new(2));
        let (primary, fallback) = build_agents(&settings, registry);
        assert_eq!(primary.provider_id(), "gemini");
        assert_eq!(fallback.unwrap().provider_id(), "openrouter");
    }
}
