use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::MonitorKey;
use crate::util::env_key_component;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// SQLite database (default; single writer, WAL)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: String,

        /// Connection pool size
        #[serde(default = "default_sqlite_connections")]
        max_connections: u32,
    },

    /// PostgreSQL (connection pool, DB-side timeline aggregation)
    Postgres {
        /// Connection string (postgres://...)
        url: String,

        /// Connection pool size
        #[serde(default = "default_postgres_connections")]
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Sqlite { path, .. } => {
                if path.is_empty() {
                    return Err("storage.path must not be empty".to_string());
                }
                Ok(())
            }
            StorageConfig::Postgres { url, .. } => {
                if url.is_empty() {
                    return Err("storage.url must not be empty".to_string());
                }
                Ok(())
            }
        }
    }

    pub fn max_connections(&self) -> u32 {
        match self {
            StorageConfig::Sqlite { max_connections, .. }
            | StorageConfig::Postgres { max_connections, .. } => *max_connections,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            max_connections: default_sqlite_connections(),
        }
    }
}

fn default_sqlite_path() -> String {
    "./relay-pulse.db".to_string()
}

fn default_sqlite_connections() -> u32 {
    5
}

fn default_postgres_connections() -> u32 {
    10
}

/// Event emission configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Per-model edges (default) or one edge per channel
    #[serde(default)]
    pub mode: EventMode,

    /// Consecutive opposing observations before a DOWN edge
    #[serde(default = "default_down_threshold")]
    pub down_threshold: i64,

    /// Consecutive opposing observations before an UP edge
    #[serde(default = "default_up_threshold")]
    pub up_threshold: i64,

    /// Optional bearer token guarding the events read API
    pub api_token: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: EventMode::default(),
            down_threshold: default_down_threshold(),
            up_threshold: default_up_threshold(),
            api_token: None,
        }
    }
}

fn default_down_threshold() -> i64 {
    2
}

fn default_up_threshold() -> i64 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    #[default]
    Model,
    Channel,
}

/// Boards feature flag. When enabled, `board: cold` monitors are kept out of
/// the probe schedule (history stays queryable).
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct BoardsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Board {
    #[default]
    Hot,
    Cold,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Default probe interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Default slow-latency threshold in milliseconds
    #[serde(default = "default_slow_latency")]
    pub slow_latency: u64,

    /// Default probe timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Per-service slow-latency overrides (milliseconds)
    #[serde(default)]
    pub slow_latency_by_service: HashMap<String, u64>,

    /// Per-service timeout overrides (seconds)
    #[serde(default)]
    pub timeout_by_service: HashMap<String, u64>,

    /// Weight of a yellow probe in availability percentages; 0 falls back to
    /// the default 0.7
    #[serde(default = "default_degraded_weight")]
    pub degraded_weight: f64,

    /// Global probe concurrency cap; -1 expands to the active monitor count,
    /// 0/missing means 10
    #[serde(default)]
    pub max_concurrency: i64,

    /// Stagger group start times (on by default)
    #[serde(default = "default_stagger_probes")]
    pub stagger_probes: bool,

    /// Cap on probe response body bytes
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    #[serde(default)]
    pub boards: BoardsConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

fn default_interval() -> u64 {
    60
}

fn default_slow_latency() -> u64 {
    5_000
}

fn default_timeout() -> u64 {
    10
}

fn default_degraded_weight() -> f64 {
    0.7
}

fn default_stagger_probes() -> bool {
    true
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

/// One configured probe target
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitorConfig {
    pub provider: String,
    pub service: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub model: String,

    /// Target URL, used verbatim
    pub url: String,

    /// HTTP method (GET if omitted)
    #[serde(default = "default_method")]
    pub method: String,

    /// Header template; values may contain `{{API_KEY}}`
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body template, sent as-is; may contain `{{API_KEY}}`
    #[serde(default)]
    pub body: String,

    /// Literal substring the response body must contain
    #[serde(default)]
    pub success_contains: String,

    /// Per-monitor interval override (seconds)
    pub interval: Option<u64>,

    /// Per-monitor slow-latency override (milliseconds)
    pub slow_latency: Option<u64>,

    /// Per-monitor timeout override (seconds)
    pub timeout: Option<u64>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub board: Board,

    /// Sort key keeping a parent monitor ahead of its children inside a group
    #[serde(default)]
    pub parent: String,

    /// Explicit environment variable holding the API key
    pub env_var_name: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl MonitorConfig {
    pub fn key(&self) -> MonitorKey {
        MonitorKey::new(
            self.provider.clone(),
            self.service.clone(),
            self.channel.clone(),
            self.model.clone(),
        )
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}

/// Fully resolved probe target: effective thresholds computed, API key
/// looked up from the environment. Immutable for the life of one config
/// generation.
#[derive(Debug, Clone)]
pub struct MonitorDef {
    pub key: MonitorKey,
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub success_contains: String,
    pub api_key: Option<String>,
    pub interval: Duration,
    pub slow_latency: Duration,
    pub timeout: Duration,
    pub disabled: bool,
    pub cold: bool,
    pub parent: String,
}

/// Resolved configuration handed to the runtime
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub monitors: Vec<Arc<MonitorDef>>,
    pub stagger_probes: bool,
    pub max_concurrency: i64,
    pub boards_enabled: bool,
    pub degraded_weight: f64,
    pub max_response_bytes: usize,
    pub events: EventsConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Validate the document before it can replace a running generation.
    /// Hot reload keeps the old config when this fails.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;

        if self.max_concurrency < -1 {
            return Err(format!(
                "max_concurrency must be >= -1, got {}",
                self.max_concurrency
            ));
        }

        if !(0.0..=1.0).contains(&self.degraded_weight) {
            return Err(format!(
                "degraded_weight must be within [0, 1], got {}",
                self.degraded_weight
            ));
        }

        if self.events.down_threshold < 1 || self.events.up_threshold < 1 {
            return Err("event thresholds must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for monitor in &self.monitors {
            let key = monitor.key();
            if monitor.provider.is_empty() || monitor.service.is_empty() {
                return Err(format!("monitor {key} needs provider and service"));
            }
            if url::Url::parse(&monitor.url).is_err() {
                return Err(format!("monitor {key} has an invalid url: {}", monitor.url));
            }
            if reqwest::Method::from_bytes(monitor.method.as_bytes()).is_err() {
                return Err(format!(
                    "monitor {key} has an invalid method: {}",
                    monitor.method
                ));
            }
            if let Some(interval) = monitor.interval
                && interval == 0
            {
                return Err(format!("monitor {key} has a zero interval"));
            }
            if !seen.insert(key.clone()) {
                return Err(format!("duplicate monitor key {key}"));
            }
        }

        Ok(())
    }

    /// Effective degraded weight; the 0 sentinel falls back to the default.
    pub fn effective_degraded_weight(&self) -> f64 {
        if self.degraded_weight == 0.0 {
            default_degraded_weight()
        } else {
            self.degraded_weight
        }
    }

    /// Resolve the document: compute effective thresholds per monitor and
    /// look up API keys from the environment.
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        let degraded_weight = self.effective_degraded_weight();

        let monitors = self
            .monitors
            .iter()
            .map(|monitor| {
                let key = monitor.key();
                let interval = monitor.interval.unwrap_or(self.interval).max(1);
                let slow_latency = monitor
                    .slow_latency
                    .or_else(|| self.slow_latency_by_service.get(&monitor.service).copied())
                    .unwrap_or(self.slow_latency);
                let timeout = monitor
                    .timeout
                    .or_else(|| self.timeout_by_service.get(&monitor.service).copied())
                    .unwrap_or(self.timeout)
                    .max(1);

                let api_key = resolve_api_key(monitor);
                if api_key.is_none()
                    && (template_needs_key(&monitor.body)
                        || monitor.headers.values().any(|v| template_needs_key(v)))
                {
                    tracing::warn!("monitor {key}: no API key resolved for {{{{API_KEY}}}} template");
                }

                let mut headers: Vec<(String, String)> = monitor
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                headers.sort();

                Arc::new(MonitorDef {
                    key,
                    url: monitor.url.clone(),
                    method: monitor.method.clone(),
                    headers,
                    body: monitor.body.clone(),
                    success_contains: monitor.success_contains.clone(),
                    api_key,
                    interval: Duration::from_secs(interval),
                    slow_latency: Duration::from_millis(slow_latency),
                    timeout: Duration::from_secs(timeout),
                    disabled: monitor.disabled,
                    cold: monitor.board == Board::Cold,
                    parent: monitor.parent.clone(),
                })
            })
            .collect();

        Ok(ResolvedConfig {
            monitors,
            stagger_probes: self.stagger_probes,
            max_concurrency: self.max_concurrency,
            boards_enabled: self.boards.enabled,
            degraded_weight,
            max_response_bytes: self.max_response_bytes,
            events: self.events,
            storage: self.storage,
        })
    }
}

fn template_needs_key(template: &str) -> bool {
    template.contains("{{API_KEY}}")
}

/// Look up the API key for a monitor. Precedence: explicit `env_var_name`,
/// then `MONITOR_<PROVIDER>_<SERVICE>_<CHANNEL>_API_KEY`, then
/// `MONITOR_<PROVIDER>_<SERVICE>_API_KEY`.
fn resolve_api_key(monitor: &MonitorConfig) -> Option<String> {
    if let Some(name) = &monitor.env_var_name
        && let Ok(value) = std::env::var(name)
        && !value.is_empty()
    {
        return Some(value);
    }

    let provider = env_key_component(&monitor.provider);
    let service = env_key_component(&monitor.service);
    let channel = env_key_component(&monitor.channel);

    if !channel.is_empty() {
        let name = format!("MONITOR_{provider}_{service}_{channel}_API_KEY");
        if let Ok(value) = std::env::var(&name)
            && !value.is_empty()
        {
            return Some(value);
        }
    }

    let name = format!("MONITOR_{provider}_{service}_API_KEY");
    match std::env::var(&name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
