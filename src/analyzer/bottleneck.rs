use std::time::Duration;

use crate::config::ThresholdsConfig;
use crate::monitor::snapshot::EntitySnapshot;

/// Dominant contributor to an entity's observed latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BottleneckType {
    None,
    Queue,
    Disk,
    Network,
    /// Slow, but no sub-component dominates. Also the state before any data.
    #[default]
    Unknown,
}

impl BottleneckType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Queue => "queue",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    pub const fn all() -> [Self; 5] {
        [
            Self::None,
            Self::Queue,
            Self::Disk,
            Self::Network,
            Self::Unknown,
        ]
    }
}

impl std::fmt::Display for BottleneckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency thresholds in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub read_ns: u64,
    pub write_ns: u64,
    pub queue_ns: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(ThresholdsConfig::default())
    }
}

impl From<ThresholdsConfig> for Thresholds {
    fn from(cfg: ThresholdsConfig) -> Self {
        Self {
            read_ns: duration_ns(cfg.read),
            write_ns: duration_ns(cfg.write),
            queue_ns: duration_ns(cfg.queue),
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Classifies one snapshot. First match wins:
/// queue (above threshold and strict maximum), disk, network,
/// unknown (read or write above threshold), none.
pub fn classify(snapshot: &EntitySnapshot, thresholds: &Thresholds) -> BottleneckType {
    let queue = snapshot.queue_latency_ns;
    let disk = snapshot.disk_latency_ns;
    let network = snapshot.network_latency_ns;

    if queue > thresholds.queue_ns && queue > disk && queue > network {
        return BottleneckType::Queue;
    }
    if disk > queue && disk > network {
        return BottleneckType::Disk;
    }
    if network > queue && network > disk {
        return BottleneckType::Network;
    }
    if snapshot.read_latency_ns > thresholds.read_ns
        || snapshot.write_latency_ns > thresholds.write_ns
    {
        return BottleneckType::Unknown;
    }
    BottleneckType::None
}
