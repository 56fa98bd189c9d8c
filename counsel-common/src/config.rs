//! Configuration management for Counsel services.
//!
//! The service reads a single configuration file at `~/.counsel/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (COUNSEL_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `COUNSEL_BIND_ADDRESS` → gateway.host
//! - `COUNSEL_PORT` → gateway.port
//! - `COUNSEL_DB_PATH` → storage.path
//! - `COUNSEL_LOG_LEVEL` → observability.log_level
//! - `COUNSEL_LOG_FORMAT` → observability.log_format
//! - `COUNSEL_LLM_BASE_URL` → llm.base_url
//! - `COUNSEL_LLM_MODEL` → llm.model
//! - `OPENAI_API_KEY` → llm.api_key

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".counsel"),
        |dirs| dirs.home_dir().join(".counsel"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Gateway Configuration
// ============================================================================

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on a whole HTTP request, generation included.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4430
}

fn default_request_timeout() -> u64 {
    120
}

// ============================================================================
// Dialogue Configuration
// ============================================================================

/// Session and context-window behaviour of the dialogue core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Maximum number of turns in a context window, new turn included.
    #[serde(default = "default_context_turns", alias = "contextWindowTurns")]
    pub context_window_turns: usize,

    /// Maximum number of characters in a context window.
    #[serde(default = "default_context_chars", alias = "contextWindowChars")]
    pub context_window_chars: usize,

    /// Sessions idle longer than this are closed on next access.
    #[serde(
        default = "default_inactivity_timeout",
        alias = "sessionInactivityTimeout"
    )]
    pub session_inactivity_timeout_secs: u64,

    /// Caller-imposed bound on a single generation call.
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,

    /// Reply substituted whenever content is blocked.
    #[serde(default = "default_safe_harbor_reply")]
    pub safe_harbor_reply: String,

    /// Reply returned when generation fails or times out.
    #[serde(default = "default_apology_reply")]
    pub apology_reply: String,

    /// Length of the stored summary of an assistant turn.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

impl DialogueConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.session_inactivity_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            context_window_turns: default_context_turns(),
            context_window_chars: default_context_chars(),
            session_inactivity_timeout_secs: default_inactivity_timeout(),
            generation_timeout_secs: default_generation_timeout(),
            safe_harbor_reply: default_safe_harbor_reply(),
            apology_reply: default_apology_reply(),
            summary_chars: default_summary_chars(),
        }
    }
}

fn default_context_turns() -> usize {
    20
}

fn default_context_chars() -> usize {
    8_000
}

fn default_inactivity_timeout() -> u64 {
    1_800 // 30 minutes
}

fn default_generation_timeout() -> u64 {
    60
}

fn default_safe_harbor_reply() -> String {
    "It sounds like you are going through something really difficult, and you deserve \
     support from a person right now. If you are in immediate danger, please contact your \
     local emergency number. You can also reach a crisis line or your campus counselling \
     service at any time. A member of our team has been notified and will follow up with you."
        .to_string()
}

fn default_apology_reply() -> String {
    "I'm sorry, I wasn't able to put together a response just now. Please try again in a moment."
        .to_string()
}

fn default_summary_chars() -> usize {
    200
}

// ============================================================================
// Safety Configuration
// ============================================================================

/// One risk category and the phrases that indicate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub name: String,
    pub phrases: Vec<String>,
}

impl SafetyRule {
    pub fn new(name: impl Into<String>, phrases: &[&str]) -> Self {
        Self {
            name: name.into(),
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Safety triage policy.
///
/// A match on a category listed in `blocked_categories` blocks the text;
/// a match on any other category flags it as sensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_blocked_categories", alias = "blockedCategories")]
    pub blocked_categories: Vec<String>,

    #[serde(default = "default_safety_rules")]
    pub categories: Vec<SafetyRule>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_categories: default_blocked_categories(),
            categories: default_safety_rules(),
        }
    }
}

fn default_blocked_categories() -> Vec<String> {
    vec!["self_harm".to_string(), "violence".to_string()]
}

fn default_safety_rules() -> Vec<SafetyRule> {
    vec![
        SafetyRule::new(
            "self_harm",
            &[
                "kill myself",
                "killing myself",
                "end my life",
                "ending my life",
                "take my own life",
                "suicide",
                "suicidal",
                "want to die",
                "hurt myself",
                "harm myself",
                "cut myself",
                "better off dead",
                "no reason to live",
            ],
        ),
        SafetyRule::new(
            "violence",
            &[
                "kill someone",
                "kill him",
                "kill her",
                "kill them",
                "shoot up",
                "bring a gun",
                "hurt someone",
                "make them pay",
            ],
        ),
        SafetyRule::new(
            "abuse",
            &[
                "abused",
                "abusing me",
                "hits me",
                "assaulted",
                "harassing me",
                "harassed",
            ],
        ),
        SafetyRule::new(
            "distress",
            &[
                "hopeless",
                "worthless",
                "can't cope",
                "cannot cope",
                "panic attack",
                "breaking down",
                "so depressed",
                "can't go on",
            ],
        ),
        SafetyRule::new(
            "substance_use",
            &["overdose", "drinking every day", "relapse", "getting high"],
        ),
    ]
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// Generation backend settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Retries per generation call before giving up
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds (doubles with each retry)
    #[serde(default = "default_llm_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
            system_prompt: default_system_prompt(),
            max_retries: default_llm_retries(),
            base_backoff_ms: default_llm_backoff_ms(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f64 {
    0.4
}

fn default_system_prompt() -> String {
    "You are a supportive academic counselling assistant for students. Give practical, \
     encouraging guidance about studies, programmes, and school life. Keep answers concise, \
     ask clarifying questions when the situation is unclear, and suggest speaking with a \
     human counsellor when a topic goes beyond academic advice."
        .to_string()
}

fn default_llm_retries() -> u32 {
    2
}

fn default_llm_backoff_ms() -> u64 {
    250
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend type (sqlite, memory)
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database path (for `SQLite`); defaults to `~/.counsel/sessions.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn db_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir().join("sessions.db"))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

fn default_storage_backend() -> String {
    "sqlite".to_string()
}

// ============================================================================
// Observability Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub dialogue: DialogueConfig,

    #[serde(default, alias = "safetyPolicy")]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("COUNSEL_BIND_ADDRESS") {
            self.gateway.host = host;
        }
        if let Some(port) = lookup("COUNSEL_PORT") {
            if let Ok(p) = port.parse() {
                self.gateway.port = p;
            }
        }
        if let Some(path) = lookup("COUNSEL_DB_PATH") {
            self.storage.path = Some(path);
        }
        if let Some(level) = lookup("COUNSEL_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("COUNSEL_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Some(url) = lookup("COUNSEL_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("COUNSEL_LLM_MODEL") {
            self.llm.model = model;
        }
        if self.llm.api_key.is_none() {
            if let Some(key) = lookup("OPENAI_API_KEY") {
                self.llm.api_key = Some(key);
            }
        }
    }

    /// The `host:port` string the gateway binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}
