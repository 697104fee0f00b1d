use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
/// Environment-level fallback for the alert webhook when the config has none.
pub const ALERT_WEBHOOK_ENV: &str = "ALERT_WEBHOOK_URL";

/// Top-level config (sitesync.toml + SITESYNC_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SitesyncConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks. The actor re-arms itself after every tick.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
        }
    }
}

/// External source of record (the legacy attendance/employee system).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the source's query endpoint. When unset, sync jobs skip.
    pub base_url: Option<String>,
    /// Optional bearer token sent with every request.
    pub api_token: Option<String>,
    /// Site code rows are filtered by.
    #[serde(default = "default_site_cd")]
    pub site_cd: String,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long an idle cached connection may be reused before it is rotated.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            site_cd: default_site_cd(),
            query_timeout_ms: default_query_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Active employees are written in sub-batches of this size during a full sync.
    #[serde(default = "default_full_batch_size")]
    pub full_batch_size: usize,
    /// Maximum operations per atomic store batch.
    #[serde(default = "default_write_chunk_limit")]
    pub write_chunk_limit: usize,
    #[serde(default = "default_full_lock_ttl_secs")]
    pub full_lock_ttl_secs: u64,
    #[serde(default = "default_incremental_lock_ttl_secs")]
    pub incremental_lock_ttl_secs: u64,
    /// Fixed lookback window of the incremental sync.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    #[serde(default)]
    pub hmac_secret: String,
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default = "default_full_retry_attempts")]
    pub full_retry_attempts: u32,
    #[serde(default = "default_incremental_retry_attempts")]
    pub incremental_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_batch_size: default_full_batch_size(),
            write_chunk_limit: default_write_chunk_limit(),
            full_lock_ttl_secs: default_full_lock_ttl_secs(),
            incremental_lock_ttl_secs: default_incremental_lock_ttl_secs(),
            lookback_secs: default_lookback_secs(),
            hmac_secret: String::new(),
            encryption_key: String::new(),
            full_retry_attempts: default_full_retry_attempts(),
            incremental_retry_attempts: default_incremental_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub webhook_url: Option<String>,
    /// Identical alert types are suppressed for this many seconds after delivery.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl AlertConfig {
    /// Configured webhook, falling back to `ALERT_WEBHOOK_URL` from the environment.
    pub fn resolve_webhook_url(&self) -> Option<String> {
        self.webhook_url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var(ALERT_WEBHOOK_ENV).ok().filter(|u| !u.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Elasticsearch-compatible ingest endpoint for sync failure documents.
    pub elasticsearch_url: Option<String>,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            elasticsearch_url: None,
            index_prefix: default_index_prefix(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_site_cd() -> String {
    "10".to_string()
}
fn default_query_timeout_ms() -> u64 {
    10_000
}
fn default_ping_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_cache_ttl_secs() -> u64 {
    30
}
fn default_full_batch_size() -> usize {
    50
}
fn default_write_chunk_limit() -> usize {
    100
}
fn default_full_lock_ttl_secs() -> u64 {
    600
}
fn default_incremental_lock_ttl_secs() -> u64 {
    240
}
fn default_lookback_secs() -> u64 {
    300
}
fn default_full_retry_attempts() -> u32 {
    2
}
fn default_incremental_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    5_000
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_index_prefix() -> String {
    "sitesync-logs".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sitesync/sitesync.db", home)
}

impl SitesyncConfig {
    /// Load config from a TOML file with SITESYNC_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `SITESYNC_SOURCE__BASE_URL`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        tracing::debug!(path = %path, "loading config");
        let config: SitesyncConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SITESYNC_").split("__"))
            .extract()
            .map_err(|e| crate::error::SitesyncError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.sitesync/sitesync.toml", home)
}
