use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tracer::event::ProbeKind;

/// Top-level configuration for the ioeye agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Collection and aggregation loop configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Start/end event pairing configuration.
    #[serde(default)]
    pub correlator: CorrelatorConfig,

    /// History and analysis configuration.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Monitored entity listing configuration.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Probe event source configuration.
    #[serde(default)]
    pub tracer: TracerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Collection and aggregation loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Aggregation cycle period. Default: 10s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Bounded tracer-to-collector channel size. Default: 65536.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Latency reported for entities with no completions in a cycle.
    #[serde(default)]
    pub idle_latency: IdleLatency,

    /// Namespace assigned to entities seen only through events. Default: "default".
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
}

/// Latency carried by a snapshot when the entity completed no operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleLatency {
    /// Keep the previous cycle's latency values.
    #[default]
    Retain,
    /// Report zero latency.
    Reset,
}

/// Start/end event pairing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelatorConfig {
    /// Age after which an unmatched start is dropped. Default: 30s.
    #[serde(default = "default_pending_horizon", with = "humantime_serde")]
    pub pending_horizon: Duration,

    /// Maximum in-flight starts held. Default: 10240.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// History and analysis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Snapshots retained per entity. Default: 100.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Lookback used for the per-cycle trend log. Default: 5m.
    #[serde(default = "default_trend_window", with = "humantime_serde")]
    pub trend_window: Duration,

    /// Percentage change beyond which a trend is increased/decreased. Default: 10.
    #[serde(default = "default_trend_change_percent")]
    pub trend_change_percent: f64,

    /// Bottleneck classification thresholds.
    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    /// Latency anomaly detection configuration.
    #[serde(default)]
    pub anomaly: AnomalyConfig,
}

/// Bottleneck classification thresholds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThresholdsConfig {
    /// Read latency considered slow. Default: 10ms.
    #[serde(default = "default_read_threshold", with = "humantime_serde")]
    pub read: Duration,

    /// Write latency considered slow. Default: 20ms.
    #[serde(default = "default_write_threshold", with = "humantime_serde")]
    pub write: Duration,

    /// Queue latency above which queueing can be the bottleneck. Default: 5ms.
    #[serde(default = "default_queue_threshold", with = "humantime_serde")]
    pub queue: Duration,
}

/// Latency anomaly detection configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnomalyConfig {
    /// Score above which the latest snapshot is anomalous. Default: 2.0.
    #[serde(default = "default_anomaly_threshold")]
    pub threshold: f64,

    /// Snapshots required before detection runs. Default: 10.
    #[serde(default = "default_min_history")]
    pub min_history: usize,

    /// Divisor of the deviation from the mean. Default: std_dev, a
    /// conventional z-score. `variance` divides by the variance instead, so
    /// scores shrink as latencies spread and seldom reach the threshold.
    #[serde(default)]
    pub z_score_denominator: ZScoreDenominator,
}

/// Divisor applied to `latest - mean` when scoring a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZScoreDenominator {
    /// Population standard deviation.
    #[default]
    StdDev,
    /// Population variance.
    Variance,
}

/// Monitored entity listing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// Scope reported for listed entities. Empty lists every namespace.
    #[serde(default)]
    pub namespace: String,

    /// Cgroup v2 mount to scan for pod slices. Empty disables scanning.
    #[serde(default)]
    pub cgroup_root: String,

    /// Statically configured entities.
    #[serde(default)]
    pub entities: Vec<StaticEntity>,
}

/// One statically configured entity.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticEntity {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Cgroup id reported by the kernel for this entity's tasks.
    #[serde(default)]
    pub cgroup_id: u64,
}

/// Probe event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TracerConfig {
    /// FIFO or file written by the probe loader. Default: "/run/ioeye/events".
    #[serde(default = "default_pipe_path")]
    pub pipe_path: String,

    /// Reopen the source after EOF. Default: true.
    #[serde(default = "default_true")]
    pub reopen_on_eof: bool,

    /// Probe kinds to consume. Empty consumes all.
    #[serde(default)]
    pub probes: Vec<String>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_event_channel_capacity() -> usize {
    65536
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_pending_horizon() -> Duration {
    Duration::from_secs(30)
}

fn default_max_pending() -> usize {
    10240
}

fn default_history_capacity() -> usize {
    100
}

fn default_trend_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_trend_change_percent() -> f64 {
    10.0
}

fn default_read_threshold() -> Duration {
    Duration::from_millis(10)
}

fn default_write_threshold() -> Duration {
    Duration::from_millis(20)
}

fn default_queue_threshold() -> Duration {
    Duration::from_millis(5)
}

fn default_anomaly_threshold() -> f64 {
    2.0
}

fn default_min_history() -> usize {
    10
}

fn default_pipe_path() -> String {
    "/run/ioeye/events".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            monitor: MonitorConfig::default(),
            correlator: CorrelatorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            directory: DirectoryConfig::default(),
            tracer: TracerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            event_channel_capacity: default_event_channel_capacity(),
            idle_latency: IdleLatency::default(),
            default_namespace: default_namespace(),
        }
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            pending_horizon: default_pending_horizon(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            trend_window: default_trend_window(),
            trend_change_percent: default_trend_change_percent(),
            thresholds: ThresholdsConfig::default(),
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            read: default_read_threshold(),
            write: default_write_threshold(),
            queue: default_queue_threshold(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            threshold: default_anomaly_threshold(),
            min_history: default_min_history(),
            z_score_denominator: ZScoreDenominator::default(),
        }
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            pipe_path: default_pipe_path(),
            reopen_on_eof: true,
            probes: Vec::new(),
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
        if self.monitor.interval.is_zero() {
            bail!("monitor.interval must be positive");
        }

        if self.monitor.event_channel_capacity == 0 {
            bail!("monitor.event_channel_capacity must be positive");
        }

        if self.monitor.default_namespace.is_empty() {
            bail!("monitor.default_namespace is required");
        }

        if self.correlator.pending_horizon.is_zero() {
            bail!("correlator.pending_horizon must be positive");
        }

        if self.correlator.max_pending == 0 {
            bail!("correlator.max_pending must be positive");
        }

        let analyzer = &self.analyzer;
        if analyzer.history_capacity < 2 {
            bail!("analyzer.history_capacity must be at least 2");
        }

        if analyzer.trend_window.is_zero() {
            bail!("analyzer.trend_window must be positive");
        }

        if !(analyzer.trend_change_percent.is_finite() && analyzer.trend_change_percent >= 0.0) {
            bail!("analyzer.trend_change_percent must be a non-negative number");
        }

        if !(analyzer.anomaly.threshold.is_finite() && analyzer.anomaly.threshold > 0.0) {
            bail!("analyzer.anomaly.threshold must be a positive number");
        }

        if analyzer.anomaly.min_history < 2 {
            bail!("analyzer.anomaly.min_history must be at least 2");
        }

        if analyzer.anomaly.min_history > analyzer.history_capacity {
            bail!(
                "analyzer.anomaly.min_history ({}) exceeds analyzer.history_capacity ({})",
                analyzer.anomaly.min_history,
                analyzer.history_capacity
            );
        }

        let mut names = HashSet::with_capacity(self.directory.entities.len());
        for entity in &self.directory.entities {
            if entity.name.is_empty() {
                bail!("directory.entities: entity name is required");
            }
            if !names.insert(entity.name.as_str()) {
                bail!("directory.entities: duplicate entity {}", entity.name);
            }
        }

        for probe in &self.tracer.probes {
            if ProbeKind::from_name(probe).is_none() {
                bail!("unknown probe in tracer.probes: {probe}");
            }
        }

        if self.tracer.pipe_path.is_empty() {
            bail!("tracer.pipe_path is required");
        }

        Ok(())
    }
}

impl TracerConfig {
    /// Probe kinds named in `probes`. Unknown names are skipped; `validate` rejects them.
    pub fn probe_kinds(&self) -> Vec<ProbeKind> {
        self.probes
            .iter()
            .filter_map(|name| ProbeKind::from_name(name))
            .collect()
    }
}
