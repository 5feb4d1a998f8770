use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Smallest accepted per-user sampling interval.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Top-level configuration for the trafficd agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// SQLite time-series database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Proxy (per-user accounting) source configuration.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// WireGuard peer source configuration.
    #[serde(default)]
    pub peers: PeersConfig,

    /// Counter handling shared by all samplers.
    #[serde(default)]
    pub counters: CountersConfig,

    /// Raw-row retention and rollup configuration.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Dashboard read-side configuration.
    #[serde(default)]
    pub dashboard: DashboardConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// SQLite database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path. Default: "trafficd.db".
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// How per-user proxy traffic is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Poll absolute per-user counters from the stats endpoint.
    PerUser,
    /// Poll aggregate inbound counters and attribute them via the access log.
    LogAttribution,
}

impl Default for ProxyMode {
    fn default() -> Self {
        Self::PerUser
    }
}

/// Proxy source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Enable proxy traffic sampling.
    #[serde(default)]
    pub enabled: bool,

    /// Accounting mode. Default: per_user.
    #[serde(default)]
    pub mode: ProxyMode,

    /// Stats endpoint base URL (e.g., "http://127.0.0.1:11111").
    #[serde(default)]
    pub stats_url: String,

    /// Proxy JSON config file holding the user roster.
    #[serde(default)]
    pub config_path: PathBuf,

    /// Request timeout for the stats endpoint. Default: 5s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Per-user sampling interval. Default: 60s, minimum 30s.
    #[serde(default = "default_proxy_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Access log tailed in log_attribution mode.
    #[serde(default)]
    pub log_path: PathBuf,

    /// Marker preceding the identity in access log lines. Default: "email: ".
    #[serde(default = "default_identity_marker")]
    pub identity_marker: String,

    /// Log poll interval in log_attribution mode. Default: 5s.
    #[serde(default = "default_log_poll_interval", with = "humantime_serde")]
    pub log_poll_interval: Duration,

    /// Aggregate counter poll interval in log_attribution mode. Default: 1m.
    #[serde(default = "default_attribution_interval", with = "humantime_serde")]
    pub attribution_interval: Duration,

    /// How recently an identity must appear in the log to receive traffic. Default: 2m.
    #[serde(default = "default_active_window", with = "humantime_serde")]
    pub active_window: Duration,

    /// Inbound tags summed for aggregate counters.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Number of aggregate points retained for the aggregate-only view. Default: 1440.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

/// WireGuard peer source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PeersConfig {
    /// Enable peer traffic sampling.
    #[serde(default)]
    pub enabled: bool,

    /// WireGuard interface name. Default: "wg0".
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Path or name of the `wg` binary. Default: "wg".
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,

    /// Peer sampling interval. Default: 60s.
    #[serde(default = "default_peer_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for one `wg show` invocation. Default: 5s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum snapshots written per tick. Default: 1000.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Display names keyed by peer public key.
    #[serde(default)]
    pub names: HashMap<String, String>,
}

/// Policy applied when a cumulative counter decreases between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Emit zero for the reset interval.
    ClampToZero,
    /// Assume the counter restarted from zero and emit the current value.
    CountFromZero,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self::ClampToZero
    }
}

impl ResetPolicy {
    /// Computes the non-negative delta between two absolute readings.
    pub fn delta(self, previous: u64, current: u64) -> u64 {
        match current.checked_sub(previous) {
            Some(delta) => delta,
            None => match self {
                Self::ClampToZero => 0,
                Self::CountFromZero => current,
            },
        }
    }
}

/// Counter handling shared by all samplers.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CountersConfig {
    /// Reset handling. Default: clamp_to_zero.
    #[serde(default)]
    pub reset_policy: ResetPolicy,
}

/// Raw-row retention and rollup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Raw per-user rows older than this many days are deleted. Default: 90.
    #[serde(default = "default_retention_days")]
    pub traffic_days: u32,

    /// Raw peer snapshots older than this many days are deleted. Default: 90.
    #[serde(default = "default_retention_days")]
    pub peer_days: u32,

    /// Raw rows older than this are rolled up into 8h buckets. Default: 7d.
    #[serde(default = "default_compress_after", with = "humantime_serde")]
    pub compress_after: Duration,

    /// Delay before the first pass after startup. Default: 30s.
    #[serde(default = "default_startup_delay", with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Interval between passes. Default: 24h.
    #[serde(default = "default_retention_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Dashboard read-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Number of entries in each top-consumer list. Default: 10.
    #[serde(default = "default_top_limit")]
    pub top_limit: usize,
}

/// Health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address for /metrics and /healthz. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("trafficd.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_proxy_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_identity_marker() -> String {
    "email: ".to_string()
}

fn default_log_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_attribution_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_active_window() -> Duration {
    Duration::from_secs(120)
}

fn default_ring_capacity() -> usize {
    1440
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_wg_binary() -> String {
    "wg".to_string()
}

fn default_peer_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_batch() -> usize {
    1000
}

fn default_retention_days() -> u32 {
    90
}

fn default_compress_after() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_startup_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_top_limit() -> usize {
    10
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            proxy: ProxyConfig::default(),
            peers: PeersConfig::default(),
            counters: CountersConfig::default(),
            retention: RetentionConfig::default(),
            dashboard: DashboardConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ProxyMode::default(),
            stats_url: String::new(),
            config_path: PathBuf::new(),
            timeout: default_source_timeout(),
            interval: default_proxy_interval(),
            log_path: PathBuf::new(),
            identity_marker: default_identity_marker(),
            log_poll_interval: default_log_poll_interval(),
            attribution_interval: default_attribution_interval(),
            active_window: default_active_window(),
            tags: Vec::new(),
            ring_capacity: default_ring_capacity(),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface: default_interface(),
            wg_binary: default_wg_binary(),
            interval: default_peer_interval(),
            timeout: default_source_timeout(),
            max_batch: default_max_batch(),
            names: HashMap::new(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            traffic_days: default_retention_days(),
            peer_days: default_retention_days(),
            compress_after: default_compress_after(),
            startup_delay: default_startup_delay(),
            interval: default_retention_interval(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            top_limit: default_top_limit(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            bail!("database.path is required");
        }

        if !self.proxy.enabled && !self.peers.enabled {
            bail!("at least one of proxy.enabled or peers.enabled must be true");
        }

        if self.proxy.enabled {
            if self.proxy.stats_url.is_empty() {
                bail!("proxy.stats_url is required when proxy is enabled");
            }
            if self.proxy.timeout.is_zero() {
                bail!("proxy.timeout must be positive");
            }

            match self.proxy.mode {
                ProxyMode::PerUser => {
                    if self.proxy.config_path.as_os_str().is_empty() {
                        bail!("proxy.config_path is required in per_user mode");
                    }
                }
                ProxyMode::LogAttribution => {
                    if self.proxy.log_path.as_os_str().is_empty() {
                        bail!("proxy.log_path is required in log_attribution mode");
                    }
                    if self.proxy.tags.is_empty() {
                        bail!("proxy.tags must name at least one inbound in log_attribution mode");
                    }
                    if self.proxy.identity_marker.is_empty() {
                        bail!("proxy.identity_marker must not be empty");
                    }
                    if self.proxy.log_poll_interval.is_zero()
                        || self.proxy.attribution_interval.is_zero()
                    {
                        bail!("proxy log and attribution intervals must be positive");
                    }
                    if self.proxy.active_window.is_zero() {
                        bail!("proxy.active_window must be positive");
                    }
                    if self.proxy.ring_capacity == 0 {
                        bail!("proxy.ring_capacity must be positive");
                    }
                }
            }
        }

        if self.peers.enabled {
            if self.peers.interface.is_empty() {
                bail!("peers.interface is required when peers are enabled");
            }
            if self.peers.interval.is_zero() {
                bail!("peers.interval must be positive");
            }
            if self.peers.timeout.is_zero() {
                bail!("peers.timeout must be positive");
            }
            if self.peers.max_batch == 0 {
                bail!("peers.max_batch must be positive");
            }
        }

        if self.retention.traffic_days == 0 || self.retention.peer_days == 0 {
            bail!("retention days must be positive");
        }
        if self.retention.compress_after.is_zero() {
            bail!("retention.compress_after must be positive");
        }
        if self.retention.compress_after >= self.retention.traffic_retention() {
            bail!("retention.compress_after must be shorter than retention.traffic_days");
        }
        if self.retention.compress_after >= self.retention.peer_retention() {
            bail!("retention.compress_after must be shorter than retention.peer_days");
        }
        if self.retention.interval.is_zero() {
            bail!("retention.interval must be positive");
        }

        if self.dashboard.top_limit == 0 {
            bail!("dashboard.top_limit must be positive");
        }

        Ok(())
    }
}

impl ProxyConfig {
    /// Returns the per-user interval with the minimum enforced.
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_SAMPLE_INTERVAL)
    }
}

impl RetentionConfig {
    /// Raw per-user retention as a duration.
    pub fn traffic_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.traffic_days) * 24 * 3600)
    }

    /// Raw peer retention as a duration.
    pub fn peer_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.peer_days) * 24 * 3600)
    }
}
