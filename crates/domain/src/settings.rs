//! Worker settings.
//!
//! Keys follow the `CLAUDE_MEM_*` naming used by the settings file at
//! `$DATA_DIR/settings.json`. Lookup order for every key:
//!
//!   1. process environment,
//!   2. the centralized env file `$DATA_DIR/.env`,
//!   3. `settings.json`,
//!   4. built-in default.
//!
//! Project-local `.env` files are deliberately ignored - credentials are
//! only read from the data directory.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::paths::DataDir;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            "SILENT" => LogLevel::Silent,
            _ => LogLevel::Info,
        }
    }

    /// Directive string for the tracing `EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Gemini,
    Openrouter,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => ProviderKind::Gemini,
            "openrouter" => ProviderKind::Openrouter,
            _ => ProviderKind::Claude,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Openrouter => "openrouter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaMode {
    Local,
    Remote,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fully-resolved worker configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub worker_port: u16,
    pub worker_host: String,
    pub log_level: LogLevel,
    pub disabled: bool,

    pub provider: ProviderKind,
    pub claude_model: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_rate_limited: bool,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,

    pub context_observations: usize,
    pub excluded_projects: Vec<String>,
    pub folder_claudemd_enabled: bool,

    pub chroma_enabled: bool,
    pub chroma_mode: ChromaMode,
    pub chroma_host: String,
    pub chroma_port: u16,
    pub chroma_ssl: bool,
    pub chroma_api_key: Option<String>,

    pub max_concurrent: usize,
    pub slot_wait_ms: u64,
    pub health_timeout_ms: u64,
    pub max_history_messages: usize,
    pub max_history_tokens: usize,
}

impl Settings {
    /// Resolve the data directory and load settings from all sources.
    pub fn load() -> Result<Self> {
        let data_dir = DataDir::resolve(std::env::var("CLAUDE_MEM_DATA_DIR").ok().as_deref());
        Self::load_from(data_dir)
    }

    /// Load settings for an explicit data directory (used by tests).
    pub fn load_from(data_dir: DataDir) -> Result<Self> {
        let source = SettingsSource::read(&data_dir)?;

        let health_timeout_ms = source
            .get_u64("CLAUDE_MEM_HEALTH_TIMEOUT_MS")
            .unwrap_or(d_health_timeout_ms())
            .clamp(500, 300_000);

        Ok(Self {
            worker_port: source
                .get_u64("CLAUDE_MEM_WORKER_PORT")
                .map(|p| p as u16)
                .unwrap_or(d_worker_port()),
            worker_host: source
                .get_str("CLAUDE_MEM_WORKER_HOST")
                .unwrap_or_else(d_worker_host),
            log_level: source
                .get_str("CLAUDE_MEM_LOG_LEVEL")
                .map(|s| LogLevel::parse(&s))
                .unwrap_or(LogLevel::Info),
            disabled: source.get_bool("CLAUDE_MEM_DISABLED").unwrap_or(false),

            provider: source
                .get_str("CLAUDE_MEM_PROVIDER")
                .map(|s| ProviderKind::parse(&s))
                .unwrap_or(ProviderKind::Claude),
            claude_model: source.get_str("CLAUDE_MEM_CLAUDE_MODEL"),
            gemini_api_key: source.get_str("CLAUDE_MEM_GEMINI_API_KEY"),
            gemini_model: source
                .get_str("CLAUDE_MEM_GEMINI_MODEL")
                .unwrap_or_else(d_gemini_model),
            gemini_rate_limited: source
                .get_bool("CLAUDE_MEM_GEMINI_RATE_LIMITED")
                .unwrap_or(false),
            openrouter_api_key: source.get_str("CLAUDE_MEM_OPENROUTER_API_KEY"),
            openrouter_model: source
                .get_str("CLAUDE_MEM_OPENROUTER_MODEL")
                .unwrap_or_else(d_openrouter_model),

            context_observations: source
                .get_u64("CLAUDE_MEM_CONTEXT_OBSERVATIONS")
                .map(|n| n as usize)
                .unwrap_or(d_context_observations()),
            excluded_projects: source
                .get_str("CLAUDE_MEM_EXCLUDED_PROJECTS")
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().to_owned())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            folder_claudemd_enabled: source
                .get_bool("CLAUDE_MEM_FOLDER_CLAUDEMD_ENABLED")
                .unwrap_or(false),

            chroma_enabled: source.get_bool("CLAUDE_MEM_CHROMA_ENABLED").unwrap_or(true),
            chroma_mode: match source
                .get_str("CLAUDE_MEM_CHROMA_MODE")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str()
            {
                "remote" => ChromaMode::Remote,
                _ => ChromaMode::Local,
            },
            chroma_host: source
                .get_str("CLAUDE_MEM_CHROMA_HOST")
                .unwrap_or_else(|| "127.0.0.1".into()),
            chroma_port: source
                .get_u64("CLAUDE_MEM_CHROMA_PORT")
                .map(|p| p as u16)
                .unwrap_or(8000),
            chroma_ssl: source.get_bool("CLAUDE_MEM_CHROMA_SSL").unwrap_or(false),
            chroma_api_key: source.get_str("CLAUDE_MEM_CHROMA_API_KEY"),

            max_concurrent: source
                .get_u64("CLAUDE_MEM_MAX_CONCURRENT")
                .map(|n| (n as usize).max(1))
                .unwrap_or(d_max_concurrent()),
            slot_wait_ms: source
                .get_u64("CLAUDE_MEM_SLOT_WAIT_MS")
                .unwrap_or(d_slot_wait_ms()),
            health_timeout_ms,
            max_history_messages: source
                .get_u64("CLAUDE_MEM_MAX_HISTORY_MESSAGES")
                .map(|n| n as usize)
                .unwrap_or(d_max_history_messages()),
            max_history_tokens: source
                .get_u64("CLAUDE_MEM_MAX_HISTORY_TOKENS")
                .map(|n| n as usize)
                .unwrap_or(d_max_history_tokens()),

            data_dir: data_dir.root().to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> DataDir {
        DataDir::new(self.data_dir.clone())
    }

    /// Whether a project label is excluded from capture.
    pub fn is_project_excluded(&self, project: &str) -> bool {
        self.excluded_projects.iter().any(|p| p == project)
    }
}

// ── defaults ────────────────────────────────────────────────────────

fn d_worker_port() -> u16 {
    37777
}
fn d_worker_host() -> String {
    "127.0.0.1".into()
}
fn d_gemini_model() -> String {
    "gemini-2.0-flash".into()
}
fn d_openrouter_model() -> String {
    "anthropic/claude-3.5-haiku".into()
}
fn d_context_observations() -> usize {
    50
}
fn d_max_concurrent() -> usize {
    3
}
fn d_slot_wait_ms() -> u64 {
    60_000
}
fn d_health_timeout_ms() -> u64 {
    15_000
}
fn d_max_history_messages() -> usize {
    40
}
fn d_max_history_tokens() -> usize {
    80_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source merging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Merged view over environment, env file, and settings file.
struct SettingsSource {
    env_file: HashMap<String, String>,
    file: HashMap<String, Value>,
}

impl SettingsSource {
    fn read(data_dir: &DataDir) -> Result<Self> {
        let file = match std::fs::read_to_string(data_dir.settings_path()) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("settings.json: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };

        let env_file = match std::fs::read_to_string(data_dir.env_file_path()) {
            Ok(raw) => parse_env_file(&raw),
            Err(_) => HashMap::new(),
        };

        Ok(Self { env_file, file })
    }

    fn get_str(&self, key: &str) -> Option<String> {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return Some(v);
            }
        }
        if let Some(v) = self.env_file.get(key) {
            if !v.is_empty() {
                return Some(v.clone());
            }
        }
        match self.file.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_str(key).and_then(|s| s.trim().parse().ok())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_str(key).map(|s| {
            matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}

/// Parse a minimal `KEY=value` env file. Lines starting with `#` and lines
/// without `=` are skipped; surrounding quotes on values are stripped.
fn parse_env_file(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            out.insert(key.trim().to_owned(), value.to_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_with_settings(json: &str) -> (tempfile::TempDir, DataDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().to_path_buf());
        std::fs::write(dd.settings_path(), json).unwrap();
        (tmp, dd)
    }

    #[test]
    fn defaults_without_any_source() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(DataDir::new(tmp.path().to_path_buf())).unwrap();
        assert_eq!(settings.worker_port, 37777);
        assert_eq!(settings.worker_host, "127.0.0.1");
        assert_eq!(settings.provider, ProviderKind::Claude);
        assert_eq!(settings.log_level, LogLevel::Info);
        assert!(settings.chroma_enabled);
        assert!(!settings.disabled);
    }

    #[test]
    fn settings_file_values_apply() {
        let (_tmp, dd) = dir_with_settings(
            r#"{
                "CLAUDE_MEM_WORKER_PORT": 40123,
                "CLAUDE_MEM_PROVIDER": "gemini",
                "CLAUDE_MEM_LOG_LEVEL": "DEBUG",
                "CLAUDE_MEM_EXCLUDED_PROJECTS": "scratch, tmp",
                "CLAUDE_MEM_GEMINI_RATE_LIMITED": true
            }"#,
        );
        let settings = Settings::load_from(dd).unwrap();
        assert_eq!(settings.worker_port, 40123);
        assert_eq!(settings.provider, ProviderKind::Gemini);
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert!(settings.gemini_rate_limited);
        assert!(settings.is_project_excluded("scratch"));
        assert!(settings.is_project_excluded("tmp"));
        assert!(!settings.is_project_excluded("real-project"));
    }

    #[test]
    fn env_file_supplies_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().to_path_buf());
        std::fs::write(
            dd.env_file_path(),
            "# credentials\nCLAUDE_MEM_GEMINI_API_KEY=\"g-key\"\n",
        )
        .unwrap();
        let settings = Settings::load_from(dd).unwrap();
        assert_eq!(settings.gemini_api_key.as_deref(), Some("g-key"));
    }

    #[test]
    fn health_timeout_is_clamped() {
        let (_tmp, dd) =
            dir_with_settings(r#"{"CLAUDE_MEM_HEALTH_TIMEOUT_MS": 10}"#);
        let settings = Settings::load_from(dd).unwrap();
        assert_eq!(settings.health_timeout_ms, 500);

        let (_tmp, dd) =
            dir_with_settings(r#"{"CLAUDE_MEM_HEALTH_TIMEOUT_MS": 9999999}"#);
        let settings = Settings::load_from(dd).unwrap();
        assert_eq!(settings.health_timeout_ms, 300_000);
    }

    #[test]
    fn invalid_settings_json_is_a_config_error() {
        let (_tmp, dd) = dir_with_settings("{not json");
        assert!(matches!(
            Settings::load_from(dd),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_file_parser_skips_comments_and_blanks() {
        let parsed = parse_env_file("# hi\n\nA=1\nB='two'\nnot-a-pair\n");
        assert_eq!(parsed.get("A").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("B").map(String::as_str), Some("two"));
        assert!(!parsed.contains_key("not-a-pair"));
    }
}
