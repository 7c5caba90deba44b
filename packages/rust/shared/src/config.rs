//! Application configuration for kwengine.
//!
//! User config lives at `~/.kwengine/kwengine.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KwEngineError, Result};
use crate::types::{Device, DynamicsPeriod};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kwengine.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kwengine";

// ---------------------------------------------------------------------------
// Config structs (matching kwengine.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Statistics service connection.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Outbound request shaping.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Batch enrichment defaults.
    #[serde(default)]
    pub enrichment: EnrichmentDefaults,

    /// Snapshot store and reconciliation cache.
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// `[stats]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Base URL of the statistics service.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// HTTP client timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.wordstat.yandex.net".into()
}
fn default_token_env() -> String {
    "WORDSTAT_TOKEN".into()
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[rate_limit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Simultaneous in-flight calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Minimum spacing between call starts, in ms.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_min_interval_ms() -> u64 {
    1000
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentDefaults {
    /// Device filter applied when a request names none.
    #[serde(default = "default_devices")]
    pub devices: Vec<Device>,

    /// Region filter applied when a request names none (empty = all regions).
    #[serde(default)]
    pub regions: Vec<u32>,

    /// Default aggregation period for dynamics.
    #[serde(default)]
    pub dynamics_period: DynamicsPeriod,

    /// Dynamics lookback window when no explicit range is given.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Per external call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Extra attempts for quota/upstream failures.
    #[serde(default)]
    pub retries: u32,
}

impl Default for EnrichmentDefaults {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            regions: Vec::new(),
            dynamics_period: DynamicsPeriod::default(),
            lookback_days: default_lookback_days(),
            call_timeout_secs: default_timeout_secs(),
            retries: 0,
        }
    }
}

fn default_devices() -> Vec<Device> {
    vec![Device::All]
}
fn default_lookback_days() -> u32 {
    30
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file. `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.kwengine/kwengine.db".into()
}

impl StorageConfig {
    /// Resolve `db_path`, expanding a leading `~`.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    KwEngineError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address the HTTP API binds to.
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
    "127.0.0.1:8787".into()
}

// ---------------------------------------------------------------------------
// Limiter config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Simultaneous in-flight calls (at least 1).
    pub max_concurrent: usize,
    /// Minimum spacing between call starts.
    pub min_interval: Duration,
}

impl LimiterConfig {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            min_interval,
        }
    }
}

impl From<&AppConfig> for LimiterConfig {
    fn from(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit.max_concurrent,
            Duration::from_millis(config.rate_limit.min_interval_ms),
        )
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kwengine/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| KwEngineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kwengine/kwengine.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KwEngineError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        KwEngineError::config(format!("failed to parse {}: {e}", path.display()))
    })?;

    url::Url::parse(&config.stats.base_url).map_err(|e| {
        KwEngineError::config(format!("invalid stats.base_url '{}': {e}", config.stats.base_url))
    })?;

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KwEngineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| KwEngineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KwEngineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the bearer token from the env var named in `[stats] token_env`.
///
/// Returns `None` when unset or empty; the orchestrator turns that into an
/// auth failure before any call is made.
pub fn resolve_api_token(config: &AppConfig) -> Option<String> {
    std::env::var(&config.stats.token_env)
        .ok()
        .filter(|val| !val.trim().is_empty())
}
