//! Configuration loading, validation, and management for llamachat.
//!
//! Loads configuration from `~/.llamachat/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.llamachat/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Native engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Prompt assembly settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// GGUF model loaded at startup, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,

    /// Upper bound on the completion loop (prompt + generated tokens)
    #[serde(default = "default_max_generation_tokens")]
    pub max_generation_tokens: u32,

    /// Token capacity of the native batch
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: u32,

    #[serde(default)]
    pub gpu_layers: u32,

    #[serde(default = "default_rope_scaling")]
    pub rope_scaling: f32,

    /// Ask the native engine to apply its own chat template on top of ours
    #[serde(default)]
    pub format_chat: bool,

    /// Role template used when rendering the prompt
    #[serde(default)]
    pub template: TemplateKind,
}

fn default_max_generation_tokens() -> u32 {
    400
}
fn default_batch_capacity() -> u32 {
    4096
}
fn default_rope_scaling() -> f32 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            max_generation_tokens: default_max_generation_tokens(),
            batch_capacity: default_batch_capacity(),
            gpu_layers: 0,
            rope_scaling: default_rope_scaling(),
            format_chat: false,
            template: TemplateKind::default(),
        }
    }
}

/// Prompt template families.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// `<|start_header_id|>role<|end_header_id|>\n\n...<|eot_id|>`
    #[default]
    Llama3,
    /// `<|im_start|>role\n...<|im_end|>\n`
    ChatML,
    /// `Role: text\n`
    Plain,
}

/// How session history is turned into a prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Newest messages that fit the token budget
    #[default]
    SlidingWindow,
    /// Recent window plus a synopsis of older turns, when a summarizer exists
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub strategy: ContextStrategy,

    /// Token budget for the assembled prompt
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Message window used by the summary strategy
    #[serde(default = "default_n_context")]
    pub n_context: usize,

    /// Message count after which older turns are summarized
    #[serde(default = "default_summary_interval")]
    pub summary_interval: usize,

    /// Inject related memories into the prompt
    #[serde(default = "default_true")]
    pub use_memory: bool,

    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_tokens() -> usize {
    2048
}
fn default_n_context() -> usize {
    10
}
fn default_summary_interval() -> usize {
    20
}
fn default_memory_limit() -> usize {
    5
}
fn default_true() -> bool {
    true
}
pub fn default_system_prompt() -> String {
    "You are a helpful AI assistant. You aim to be accurate, informative, and engaging. \
     You should be direct in your responses and avoid disclaimers. \
     If you're unsure about something, admit it rather than making assumptions."
        .into()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::default(),
            max_tokens: default_max_tokens(),
            n_context: default_n_context(),
            summary_interval: default_summary_interval(),
            use_memory: true,
            memory_limit: default_memory_limit(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum word-set similarity for a fuzzy hit
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f32,

    /// Only queries shorter than this (in characters) are matched fuzzily
    #[serde(default = "default_fuzzy_max_len")]
    pub fuzzy_max_len: usize,
}

fn default_fuzzy_threshold() -> f32 {
    0.8
}
fn default_fuzzy_max_len() -> usize {
    20
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fuzzy_threshold: default_fuzzy_threshold(),
            fuzzy_max_len: default_fuzzy_max_len(),
        }
    }
}

/// Durable storage backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Process lifetime only
    #[default]
    Memory,
    /// JSON-lines file
    File,
    /// SQLite database
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Backend location; defaults under the config directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl StorageConfig {
    /// Resolved on-disk location for file-based backends.
    pub fn resolved_path(&self) -> PathBuf {
        match (&self.path, self.backend) {
            (Some(p), _) => PathBuf::from(p),
            (None, StorageBackendKind::Sqlite) => AppConfig::config_dir().join("llamachat.db"),
            (None, _) => AppConfig::config_dir().join("storage.jsonl"),
        }
    }
}

impl AppConfig {
    /// Load from `~/.llamachat/config.toml`, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (highest priority).
    ///
    /// `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("LLAMACHAT_MODEL") {
            self.engine.model_path = Some(model);
        }
        if let Some(prompt) = lookup("LLAMACHAT_SYSTEM_PROMPT") {
            self.context.system_prompt = prompt;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".llamachat")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.context.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_tokens must be > 0".into(),
            ));
        }

        if !(self.cache.fuzzy_threshold > 0.0 && self.cache.fuzzy_threshold <= 1.0) {
            return Err(ConfigError::ValidationError(
                "cache.fuzzy_threshold must be in (0.0, 1.0]".into(),
            ));
        }

        if self.engine.max_generation_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_generation_tokens must be > 0".into(),
            ));
        }

        if self.engine.rope_scaling <= 0.0 {
            return Err(ConfigError::ValidationError(
                "engine.rope_scaling must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.context.strategy, ContextStrategy::SlidingWindow);
        assert_eq!(config.context.max_tokens, 2048);
        assert_eq!(config.engine.max_generation_tokens, 400);
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.context.max_tokens, config.context.max_tokens);
        assert_eq!(parsed.engine.template, config.engine.template);
    }

    #[test]
    fn invalid_threshold_rejected() {
        let mut config = AppConfig::default();
        config.cache.fuzzy_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_budget_rejected() {
        let mut config = AppConfig::default();
        config.context.max_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().context.n_context, 10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[context]
strategy = "summary"
max_tokens = 512

[engine]
template = "chatml"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.context.strategy, ContextStrategy::Summary);
        assert_eq!(config.context.max_tokens, 512);
        assert_eq!(config.context.memory_limit, 5);
        assert_eq!(config.engine.template, TemplateKind::ChatML);
        assert!(config.cache.enabled);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[context\nmax_tokens = ").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn env_overrides_model_and_prompt() {
        let mut config = AppConfig::default();
        config.apply_env(|name| match name {
            "LLAMACHAT_MODEL" => Some("/models/llama-3.2-1b.gguf".into()),
            "LLAMACHAT_SYSTEM_PROMPT" => Some("Be brief.".into()),
            _ => None,
        });
        assert_eq!(
            config.engine.model_path.as_deref(),
            Some("/models/llama-3.2-1b.gguf")
        );
        assert_eq!(config.context.system_prompt, "Be brief.");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("sliding_window"));
        assert!(toml_str.contains("max_generation_tokens = 400"));
    }
}
