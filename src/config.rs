//! Configuration parsing and validation.
//!
//! The monitor reads a TOML file (default `config/tosmon.toml`). Every
//! section is optional; missing fields fall back to the defaults below.
//!
//! ```toml
//! [storage]
//! backend = "filesystem"      # filesystem | s3 | memory
//! root = "./data"
//!
//! [fetch]
//! timeout_secs = 30
//! max_retries = 3
//! concurrency = 4
//!
//! [detection]
//! persist_on_cosmetic = true
//!
//! [summarizer]
//! provider = "openai"         # disabled | openai | openrouter
//! model = "gpt-4o-mini"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [logging]
//! format = "pretty"           # pretty | json
//! ```
//!
//! The list of tracked documents is not part of this file; it lives in the
//! blob store at `config/documents.json`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MonitorError, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_root(),
            bucket: None,
            region: default_region(),
            prefix: String::new(),
            endpoint_url: None,
        }
    }
}

fn default_backend() -> String {
    "filesystem".to_string()
}
fn default_root() -> PathBuf {
    PathBuf::from("./data")
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    /// Per-request timeout.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Budget for a whole fetch including retries.
    #[serde(default = "default_fetch_deadline")]
    pub deadline_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub keep_raw: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_retries: default_max_retries(),
            deadline_secs: default_fetch_deadline(),
            user_agent: default_user_agent(),
            concurrency: default_concurrency(),
            keep_raw: false,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_fetch_deadline() -> u64 {
    120
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
        .to_string()
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    /// Store snapshots whose only differences are dates, versions and
    /// similar volatile markers.
    #[serde(default = "default_true")]
    pub persist_on_cosmetic: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            persist_on_cosmetic: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_summarizer_deadline")]
    pub deadline_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            api_key_env: None,
            timeout_secs: default_summarizer_timeout(),
            max_retries: default_max_retries(),
            deadline_secs: default_summarizer_deadline(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.provider.as_str()) {
            (Some(url), _) => url.as_str(),
            (None, "openrouter") => "https://openrouter.ai/api/v1",
            (None, _) => "https://api.openai.com/v1",
        }
    }

    pub fn api_key_env(&self) -> &str {
        match (&self.api_key_env, self.provider.as_str()) {
            (Some(name), _) => name.as_str(),
            (None, "openrouter") => "OPENROUTER_API_KEY",
            (None, _) => "OPENAI_API_KEY",
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_summarizer_timeout() -> u64 {
    60
}
fn default_summarizer_deadline() -> u64 {
    300
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            filter: None,
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)
            .map_err(|e| MonitorError::Config(format!("failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "filesystem" | "memory" => {}
            "s3" => {
                if self.storage.bucket.as_deref().unwrap_or("").is_empty() {
                    return Err(MonitorError::Config(
                        "storage.bucket must be set when backend is 's3'".to_string(),
                    ));
                }
            }
            other => {
                return Err(MonitorError::Config(format!(
                    "unknown storage backend: '{}'. Must be filesystem, s3, or memory.",
                    other
                )))
            }
        }

        if self.fetch.concurrency == 0 {
            return Err(MonitorError::Config(
                "fetch.concurrency must be >= 1".to_string(),
            ));
        }
        if self.fetch.timeout_secs == 0 || self.fetch.deadline_secs == 0 {
            return Err(MonitorError::Config(
                "fetch.timeout_secs and fetch.deadline_secs must be > 0".to_string(),
            ));
        }

        match self.summarizer.provider.as_str() {
            "disabled" => {}
            "openai" | "openrouter" => {
                if self.summarizer.model.is_none() {
                    return Err(MonitorError::Config(format!(
                        "summarizer.model must be specified when provider is '{}'",
                        self.summarizer.provider
                    )));
                }
                if self.summarizer.deadline_secs == 0 {
                    return Err(MonitorError::Config(
                        "summarizer.deadline_secs must be > 0".to_string(),
                    ));
                }
            }
            other => {
                return Err(MonitorError::Config(format!(
                    "unknown summarizer provider: '{}'. Must be disabled, openai, or openrouter.",
                    other
                )))
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(MonitorError::Config(format!(
                    "unknown logging format: '{}'. Must be pretty or json.",
                    other
                )))
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MonitorError::Config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Config::from_toml_str(&content)
}
