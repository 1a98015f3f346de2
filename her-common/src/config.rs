//! Configuration management for the her chat backend.
//!
//! Configuration is read once at startup. On `SIGHUP` the server re-reads it
//! and applies only the Redis connection settings.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (a `.env` file in the working directory is loaded first)
//! 2. Values from the JSON config file (`HER_CONFIG`, or `./her.json` when present)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Server
//! - `HER_HOST` → server.host
//! - `HER_PORT` → server.port
//!
//! ## Storage
//! - `STORAGE_BACKEND` → storage.backend (`redis`, `file`, `memory`)
//! - `SESSION_TTL_SECS` → storage.ttl_secs (`0` disables expiry)
//! - `CHAT_HISTORY_DIR` → storage.file_dir
//! - `REDIS_HOST`, `REDIS_PORT`, `REDIS_USERNAME`, `REDIS_PASSWORD` → storage.redis.*
//! - `REDIS_TLS`, `REDIS_TLS_INSECURE` → storage.redis.tls / tls_insecure
//! - `REDIS_RETRIES`, `REDIS_RETRY_DELAY_SECS` → storage.redis.retries / retry_delay_secs
//! - `REDIS_COMMAND_TIMEOUT_SECS` → storage.redis.command_timeout_secs
//!
//! ## Model
//! - `DEEPSEEK_API_KEY` (or `OPENAI_API_KEY`) → llm.api_key
//! - `LLM_BASE_URL`, `LLM_MODEL`, `LLM_TEMPERATURE`, `LLM_STREAM` → llm.*
//!
//! ## Logging
//! - `LOG_LEVEL`, `LOG_FORMAT`, `LOG_TO_FILE`, `LOG_DIR`, `LOG_BACKUP_COUNT` → observability.*

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "her.json";

/// Default prompt framing the conversation for the model.
pub const DEFAULT_SYSTEM_PROMPT: &str = "The following is a friendly conversation between a human and an AI. \
The AI is talkative and provides lots of specific details from its context. \
If the AI does not know the answer to a question, it truthfully says it does not know.";

// ============================================================================
// Server Configuration
// ============================================================================

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Which store holds transcripts when everything is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Redis, with the in-memory store as fallback
    Redis,
    /// One JSON file per session on local disk
    File,
    /// Process memory only
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!("unknown storage backend: {other}"))),
        }
    }
}

/// Transcript storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Prefix prepended to every session key in shared stores.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Transcript time-to-live in seconds. `None` keeps transcripts forever.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: Option<u64>,

    /// Directory used by the file backend.
    #[serde(default = "default_file_dir")]
    pub file_dir: PathBuf,

    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            file_dir: default_file_dir(),
            redis: RedisConfig::default(),
        }
    }
}

/// Redis connection parameters and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host. When unset the remote tier is disabled.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default = "default_redis_username")]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Connect over TLS (hosted Redis offerings usually require it).
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Skip server certificate verification.
    #[serde(default = "default_true")]
    pub tls_insecure: bool,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Longest wait for a reply to a single command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Attempts per connect, including the first.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Minimum spacing between reconnect attempts while degraded.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_redis_port(),
            username: default_redis_username(),
            password: None,
            tls: true,
            tls_insecure: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            retries: default_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }
}

// ============================================================================
// Model Configuration
// ============================================================================

/// Chat-completion provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_name")]
    pub provider: String,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    /// Stream the answer as it is generated. When off, the whole answer is
    /// requested at once and sent as a single chunk.
    #[serde(default = "default_true")]
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_name(),
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_llm_model(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_llm_timeout_secs(),
            stream: true,
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_true")]
    pub log_to_file: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Rotated log files kept on disk.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_to_file: true,
            log_dir: default_log_dir(),
            backup_count: default_backup_count(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// What happened while loading, for logging once a subscriber exists.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Config file that was read, if any.
    pub config_file: Option<PathBuf>,
    /// Environment overrides that were ignored.
    pub warnings: Vec<String>,
}

impl LoadReport {
    /// Emit the report through `tracing`.
    pub fn log(&self) {
        match &self.config_file {
            Some(path) => tracing::info!(path = %path.display(), "Loaded config file"),
            None => tracing::info!("No config file found, using defaults"),
        }
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
    }
}

impl Config {
    /// Config file location: `HER_CONFIG`, else `./her.json`.
    pub fn config_path() -> PathBuf {
        std::env::var("HER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config from {}: {e}", path.display()))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config from {}: {e}", path.display()))
        })
    }

    /// Load `.env`, the config file and environment overrides, then validate.
    ///
    /// Nothing is logged here; call [`LoadReport::log`] after logging is set up.
    pub fn load_with_env() -> Result<(Self, LoadReport)> {
        // A missing .env file is normal in deployed environments.
        let _ = dotenvy::dotenv();
        Self::load_layers()
    }

    /// Like [`Config::load_with_env`], but values in `.env` replace the ones
    /// already in the process environment.
    pub fn reload() -> Result<(Self, LoadReport)> {
        let _ = dotenvy::dotenv_override();
        Self::load_layers()
    }

    fn load_layers() -> Result<(Self, LoadReport)> {
        let mut report = LoadReport::default();
        let path = Self::config_path();
        let mut config = if path.exists() {
            let config = Self::load_from(&path)?;
            report.config_file = Some(path);
            config
        } else {
            Self::default()
        };

        report.warnings = config.apply_env_overrides();
        config.validate()?;
        Ok((config, report))
    }

    /// Apply environment variable overrides, returning one warning per
    /// ignored value.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`.
    ///
    /// Values that fail to parse are skipped and reported in the returned
    /// list, so a typo in one variable does not take the whole service down.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        // Server
        if let Some(host) = get("HER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_var(&get, &mut warnings, "HER_PORT") {
            self.server.port = port;
        }

        // Storage
        if let Some(backend) = parse_var(&get, &mut warnings, "STORAGE_BACKEND") {
            self.storage.backend = backend;
        }
        if let Some(ttl) = parse_var::<u64, _>(&get, &mut warnings, "SESSION_TTL_SECS") {
            self.storage.ttl_secs = (ttl > 0).then_some(ttl);
        }
        if let Some(dir) = get("CHAT_HISTORY_DIR") {
            self.storage.file_dir = PathBuf::from(dir);
        }

        let redis = &mut self.storage.redis;
        if let Some(host) = get("REDIS_HOST") {
            redis.host = Some(host);
        }
        if let Some(port) = parse_var(&get, &mut warnings, "REDIS_PORT") {
            redis.port = port;
        }
        if let Some(username) = get("REDIS_USERNAME") {
            redis.username = username;
        }
        if let Some(password) = get("REDIS_PASSWORD") {
            redis.password = Some(password);
        }
        if let Some(tls) = parse_bool(&get, &mut warnings, "REDIS_TLS") {
            redis.tls = tls;
        }
        if let Some(insecure) = parse_bool(&get, &mut warnings, "REDIS_TLS_INSECURE") {
            redis.tls_insecure = insecure;
        }
        if let Some(retries) = parse_var(&get, &mut warnings, "REDIS_RETRIES") {
            redis.retries = retries;
        }
        if let Some(delay) = parse_var(&get, &mut warnings, "REDIS_RETRY_DELAY_SECS") {
            redis.retry_delay_secs = delay;
        }
        if let Some(timeout) = parse_var(&get, &mut warnings, "REDIS_COMMAND_TIMEOUT_SECS") {
            redis.command_timeout_secs = timeout;
        }

        // Model
        if let Some(key) = get("DEEPSEEK_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = get("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = get("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(temperature) = parse_var(&get, &mut warnings, "LLM_TEMPERATURE") {
            self.llm.temperature = temperature;
        }
        if let Some(stream) = parse_bool(&get, &mut warnings, "LLM_STREAM") {
            self.llm.stream = stream;
        }

        // Logging
        let obs = &mut self.observability;
        if let Some(level) = get("LOG_LEVEL") {
            obs.log_level = level.to_lowercase();
        }
        if let Some(format) = get("LOG_FORMAT") {
            obs.log_format = format.to_lowercase();
        }
        if let Some(to_file) = parse_bool(&get, &mut warnings, "LOG_TO_FILE") {
            obs.log_to_file = to_file;
        }
        if let Some(dir) = get("LOG_DIR") {
            obs.log_dir = PathBuf::from(dir);
        }
        if let Some(count) = parse_var(&get, &mut warnings, "LOG_BACKUP_COUNT") {
            obs.backup_count = count;
        }

        warnings
    }

    /// Reject configurations that cannot work at all.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".into()));
        }
        if self.storage.redis.command_timeout_secs == 0 {
            return Err(Error::Config(
                "storage.redis.command_timeout_secs must be at least 1".into(),
            ));
        }
        if self.storage.redis.retries == 0 {
            return Err(Error::Config("storage.redis.retries must be at least 1".into()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(Error::Config(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            )));
        }
        if self.storage.key_prefix.is_empty() {
            return Err(Error::Config("storage.key_prefix must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T, G>(get: &G, warnings: &mut Vec<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("Ignoring unparsable environment override {name}={raw:?}"));
            None
        }
    }
}

fn parse_bool<G>(get: &G, warnings: &mut Vec<String>, name: &str) -> Option<bool>
where
    G: Fn(&str) -> Option<String>,
{
    let raw = get(name)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warnings.push(format!("Ignoring unparsable boolean override {name}={raw:?}"));
            None
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

fn default_backend() -> StorageBackend {
    StorageBackend::Redis
}

fn default_key_prefix() -> String {
    "message_store:".into()
}

#[allow(clippy::unnecessary_wraps)]
fn default_ttl_secs() -> Option<u64> {
    Some(3600)
}

fn default_file_dir() -> PathBuf {
    PathBuf::from("chat_histories")
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_username() -> String {
    "default".into()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    2
}

fn default_reconnect_interval_secs() -> u64 {
    30
}

fn default_llm_name() -> String {
    "deepseek".into()
}

fn default_llm_base_url() -> String {
    "https://api.deepseek.com".into()
}

fn default_llm_model() -> String {
    "deepseek-chat".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_backup_count() -> usize {
    5
}
