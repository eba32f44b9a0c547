use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{ChatRelayError, Result};

/// Environment variable that overrides `upstream.base_url`
pub const BASE_URL_ENV: &str = "LITELLM_BASE_URL";

/// Environment variable that overrides `title.model`
pub const TITLE_MODEL_ENV: &str = "TITLE_MODEL";

/// Main configuration structure for chatrelay
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// LLM gateway configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Streaming relay tuning
    #[serde(default)]
    pub relay: RelayConfig,
    /// Conversation title generation
    #[serde(default)]
    pub title: TitleConfig,
}

impl Config {
    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChatRelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| ChatRelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load the config from an explicit path, or the first default location
    /// that exists, falling back to built-in defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        for path in default_config_paths() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(&path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Apply `LITELLM_BASE_URL` and `TITLE_MODEL` overrides read through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(BASE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.upstream.base_url = Some(url);
        }
        if let Some(model) = lookup(TITLE_MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.title.model = model;
        }
        self
    }

    /// Resolve the gateway API key from the configured environment variable.
    /// An unset or empty variable means no Authorization header is sent.
    pub fn api_key<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(&self.upstream.api_key_env).filter(|key| !key.is_empty())
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    [
        dirs::home_dir().map(|h| h.join(".chatrelay").join("config.toml")),
        dirs::config_dir().map(|c| c.join("chatrelay").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

/// LLM gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Gateway base URL; resolved against the runtime environment when unset
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the gateway API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model alias used when the client does not name one
    #[serde(default = "default_model")]
    pub default_model: String,
    /// TCP connect timeout in seconds. Streams have no overall timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "LITELLM_MASTER_KEY".to_string()
}

fn default_model() -> String {
    "groq-gpt-oss-20b".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Streaming relay tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Capacity of the per-session handoff queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum characters of an upstream error body surfaced to clients
    #[serde(default = "default_error_preview_chars")]
    pub error_preview_chars: usize,
    /// Substring that marks an in-band gateway connectivity failure
    #[serde(default = "default_proxy_error_marker")]
    pub proxy_error_marker: String,
}

impl RelayConfig {
    /// Queue capacity clamped to at least one slot
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            error_preview_chars: default_error_preview_chars(),
            proxy_error_marker: default_proxy_error_marker(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

fn default_error_preview_chars() -> usize {
    500
}

fn default_proxy_error_marker() -> String {
    "litellm.APIConnectionError".to_string()
}

/// Conversation title generation
#[derive(Debug, Clone, Deserialize)]
pub struct TitleConfig {
    /// Generate a title after the first assistant reply
    #[serde(default = "default_title_enabled")]
    pub enabled: bool,
    /// Model alias used for title generation
    #[serde(default = "default_title_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_title_timeout_secs")]
    pub timeout_secs: u64,
    /// Characters of each message sent to the title model
    #[serde(default = "default_title_input_chars")]
    pub input_chars: usize,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: default_title_enabled(),
            model: default_title_model(),
            timeout_secs: default_title_timeout_secs(),
            input_chars: default_title_input_chars(),
        }
    }
}

fn default_title_enabled() -> bool {
    true
}

fn default_title_model() -> String {
    "groq-llama3-8b".to_string()
}

fn default_title_timeout_secs() -> u64 {
    30
}

fn default_title_input_chars() -> usize {
    1000
}
