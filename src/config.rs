use chrono::Duration;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug)]
pub struct Config {
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub message_ttl: Duration,
    pub thread_ttl: Duration,
    pub smart_folder_ttl: Duration,
    pub sweep_interval: std::time::Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteBackend {
    Http {
        url: String,
        username: Option<String>,
        password_command: Option<String>,
    },
    Dir {
        path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    pub store_object: String,
    pub lease_object: String,
    pub holder: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: std::time::Duration,
    pub lease_window: Duration,
    pub lease_refresh_fraction: f64,
    pub timeout: std::time::Duration,
    pub max_attempts: u32,
    pub backoff_base: std::time::Duration,
    pub backoff_max: std::time::Duration,
    pub degraded_after: u32,
    pub shutdown_grace: std::time::Duration,
}

/// Tunables for the derivation engine. Any change here invalidates stored
/// scores and categories (see `invalidator::analysis_fingerprint`).
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub sender_threshold: u32,
    pub domain_threshold: u32,
    pub history_window: Duration,
    pub recency_half_life_hours: f64,
    pub active_window: Duration,
    pub duplicate_window: Duration,
    pub thread_analysis: bool,
    pub priority_scoring: bool,
    /// Lower-cased.
    pub owner_addresses: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("missing {0}")]
    Missing(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    cache: RawCacheConfig,
    #[serde(default)]
    remote: Option<RawRemoteConfig>,
    #[serde(default)]
    sync: RawSyncConfig,
    #[serde(default)]
    analysis: RawAnalysisConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCacheConfig {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default = "default_message_ttl_hours")]
    message_ttl_hours: u32,
    #[serde(default = "default_thread_ttl_hours")]
    thread_ttl_hours: u32,
    #[serde(default = "default_smart_folder_ttl_hours")]
    smart_folder_ttl_hours: u32,
    #[serde(default = "default_sweep_interval_secs")]
    sweep_interval_secs: u64,
}

impl Default for RawCacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            message_ttl_hours: default_message_ttl_hours(),
            thread_ttl_hours: default_thread_ttl_hours(),
            smart_folder_ttl_hours: default_smart_folder_ttl_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRemoteConfig {
    backend: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password_command: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default = "default_store_object")]
    store_object: String,
    #[serde(default = "default_lease_object")]
    lease_object: String,
    #[serde(default)]
    holder: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSyncConfig {
    #[serde(default = "default_interval_secs")]
    interval_secs: u64,
    #[serde(default = "default_lease_window_secs")]
    lease_window_secs: u32,
    #[serde(default = "default_lease_refresh_fraction")]
    lease_refresh_fraction: f64,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    backoff_max_ms: u64,
    #[serde(default = "default_degraded_after")]
    degraded_after: u32,
    #[serde(default = "default_shutdown_grace_secs")]
    shutdown_grace_secs: u64,
}

impl Default for RawSyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lease_window_secs: default_lease_window_secs(),
            lease_refresh_fraction: default_lease_refresh_fraction(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            degraded_after: default_degraded_after(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalysisConfig {
    #[serde(default = "default_sender_threshold")]
    sender_threshold: u32,
    #[serde(default = "default_domain_threshold")]
    domain_threshold: u32,
    #[serde(default = "default_history_window_days")]
    history_window_days: u32,
    #[serde(default = "default_recency_half_life_hours")]
    recency_half_life_hours: f64,
    #[serde(default = "default_active_window_days")]
    active_window_days: u32,
    #[serde(default = "default_duplicate_window_hours")]
    duplicate_window_hours: u32,
    #[serde(default = "default_true")]
    thread_analysis: bool,
    #[serde(default = "default_true")]
    priority_scoring: bool,
    #[serde(default)]
    owner_addresses: Vec<String>,
}

impl Default for RawAnalysisConfig {
    fn default() -> Self {
        Self {
            sender_threshold: default_sender_threshold(),
            domain_threshold: default_domain_threshold(),
            history_window_days: default_history_window_days(),
            recency_half_life_hours: default_recency_half_life_hours(),
            active_window_days: default_active_window_days(),
            duplicate_window_hours: default_duplicate_window_hours(),
            thread_analysis: true,
            priority_scoring: true,
            owner_addresses: Vec::new(),
        }
    }
}

fn default_message_ttl_hours() -> u32 {
    24
}

fn default_thread_ttl_hours() -> u32 {
    12
}

fn default_smart_folder_ttl_hours() -> u32 {
    48
}

fn default_sweep_interval_secs() -> u64 {
    900
}

fn default_store_object() -> String {
    "mailcache.json".to_string()
}

fn default_lease_object() -> String {
    "mailcache.lease".to_string()
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_lease_window_secs() -> u32 {
    300
}

fn default_lease_refresh_fraction() -> f64 {
    0.5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    4
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_degraded_after() -> u32 {
    3
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_sender_threshold() -> u32 {
    7
}

fn default_domain_threshold() -> u32 {
    10
}

fn default_history_window_days() -> u32 {
    90
}

fn default_recency_half_life_hours() -> f64 {
    72.0
}

fn default_active_window_days() -> u32 {
    30
}

fn default_duplicate_window_hours() -> u32 {
    24
}

fn default_true() -> bool {
    true
}

pub fn default_config_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("mailcache").join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("mailcache")
            .join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

pub fn default_cache_path() -> PathBuf {
    let dir = if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join("mailcache")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".cache").join("mailcache")
    } else {
        PathBuf::from("/tmp").join("mailcache")
    };
    dir.join("store.redb")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let remote = raw
            .remote
            .ok_or_else(|| ConfigError::Missing("[remote] section".to_string()))?;
        let backend = match remote.backend.as_deref().unwrap_or("http") {
            "http" => RemoteBackend::Http {
                url: remote
                    .url
                    .ok_or_else(|| ConfigError::Missing("url in [remote]".to_string()))?,
                username: remote.username,
                password_command: remote.password_command,
            },
            "dir" => RemoteBackend::Dir {
                path: remote
                    .path
                    .ok_or_else(|| ConfigError::Missing("path in [remote]".to_string()))?,
            },
            other => {
                return Err(ConfigError::Parse(format!(
                    "unknown backend '{}' in [remote] (expected http or dir)",
                    other
                )))
            }
        };
        if remote.store_object == remote.lease_object {
            return Err(ConfigError::Parse(
                "store_object and lease_object must differ".to_string(),
            ));
        }

        let sync = raw.sync;
        if !(sync.lease_refresh_fraction > 0.0 && sync.lease_refresh_fraction < 1.0) {
            return Err(ConfigError::Parse(format!(
                "lease_refresh_fraction must be between 0 and 1, got {}",
                sync.lease_refresh_fraction
            )));
        }
        if sync.lease_window_secs == 0 {
            return Err(ConfigError::Parse(
                "lease_window_secs must be greater than 0".to_string(),
            ));
        }
        if sync.interval_secs == 0 || raw.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Parse(
                "interval_secs and sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if sync.max_attempts == 0 {
            return Err(ConfigError::Parse(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        let analysis = raw.analysis;
        if analysis.sender_threshold == 0 || analysis.domain_threshold == 0 {
            return Err(ConfigError::Parse(
                "sender_threshold and domain_threshold must be greater than 0".to_string(),
            ));
        }
        if analysis.recency_half_life_hours <= 0.0 {
            return Err(ConfigError::Parse(
                "recency_half_life_hours must be positive".to_string(),
            ));
        }

        Ok(Config {
            cache: CacheConfig {
                path: raw.cache.path.unwrap_or_else(default_cache_path),
                message_ttl: Duration::hours(i64::from(raw.cache.message_ttl_hours)),
                thread_ttl: Duration::hours(i64::from(raw.cache.thread_ttl_hours)),
                smart_folder_ttl: Duration::hours(i64::from(raw.cache.smart_folder_ttl_hours)),
                sweep_interval: std::time::Duration::from_secs(raw.cache.sweep_interval_secs),
            },
            remote: RemoteConfig {
                backend,
                store_object: remote.store_object,
                lease_object: remote.lease_object,
                holder: remote.holder,
            },
            sync: SyncConfig {
                interval: std::time::Duration::from_secs(sync.interval_secs),
                lease_window: Duration::seconds(i64::from(sync.lease_window_secs)),
                lease_refresh_fraction: sync.lease_refresh_fraction,
                timeout: std::time::Duration::from_secs(sync.timeout_secs),
                max_attempts: sync.max_attempts,
                backoff_base: std::time::Duration::from_millis(sync.backoff_base_ms),
                backoff_max: std::time::Duration::from_millis(sync.backoff_max_ms),
                degraded_after: sync.degraded_after,
                shutdown_grace: std::time::Duration::from_secs(sync.shutdown_grace_secs),
            },
            analysis: AnalysisConfig {
                sender_threshold: analysis.sender_threshold,
                domain_threshold: analysis.domain_threshold,
                history_window: Duration::days(i64::from(analysis.history_window_days)),
                recency_half_life_hours: analysis.recency_half_life_hours,
                active_window: Duration::days(i64::from(analysis.active_window_days)),
                duplicate_window: Duration::hours(i64::from(analysis.duplicate_window_hours)),
                thread_analysis: analysis.thread_analysis,
                priority_scoring: analysis.priority_scoring,
                owner_addresses: analysis
                    .owner_addresses
                    .iter()
                    .map(|a| a.trim().to_lowercase())
                    .filter(|a| !a.is_empty())
                    .collect(),
            },
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let raw = RawSyncConfig::default();
        SyncConfig {
            interval: std::time::Duration::from_secs(raw.interval_secs),
            lease_window: Duration::seconds(i64::from(raw.lease_window_secs)),
            lease_refresh_fraction: raw.lease_refresh_fraction,
            timeout: std::time::Duration::from_secs(raw.timeout_secs),
            max_attempts: raw.max_attempts,
            backoff_base: std::time::Duration::from_millis(raw.backoff_base_ms),
            backoff_max: std::time::Duration::from_millis(raw.backoff_max_ms),
            degraded_after: raw.degraded_after,
            shutdown_grace: std::time::Duration::from_secs(raw.shutdown_grace_secs),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let raw = RawAnalysisConfig::default();
        AnalysisConfig {
            sender_threshold: raw.sender_threshold,
            domain_threshold: raw.domain_threshold,
            history_window: Duration::days(i64::from(raw.history_window_days)),
            recency_half_life_hours: raw.recency_half_life_hours,
            active_window: Duration::days(i64::from(raw.active_window_days)),
            duplicate_window: Duration::hours(i64::from(raw.duplicate_window_hours)),
            thread_analysis: raw.thread_analysis,
            priority_scoring: raw.priority_scoring,
            owner_addresses: raw.owner_addresses,
        }
    }
}
