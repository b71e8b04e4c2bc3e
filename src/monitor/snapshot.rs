use std::sync::Arc;
use std::time::SystemTime;

use crate::tracer::event::EntityId;

/// One entity's measurements for one aggregation cycle.
///
/// Latencies are nanoseconds, rates are per second. Never mutated once
/// stored in history.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub entity: EntityId,
    pub namespace: Arc<str>,
    pub read_latency_ns: u64,
    pub write_latency_ns: u64,
    pub read_iops: f64,
    pub write_iops: f64,
    pub read_throughput_bps: f64,
    pub write_throughput_bps: f64,
    pub queue_latency_ns: u64,
    pub disk_latency_ns: u64,
    pub network_latency_ns: u64,
    pub timestamp: SystemTime,
}

impl EntitySnapshot {
    /// A snapshot with every measurement zeroed.
    pub fn empty(entity: EntityId, namespace: Arc<str>, timestamp: SystemTime) -> Self {
        Self {
            entity,
            namespace,
            read_latency_ns: 0,
            write_latency_ns: 0,
            read_iops: 0.0,
            write_iops: 0.0,
            read_throughput_bps: 0.0,
            write_throughput_bps: 0.0,
            queue_latency_ns: 0,
            disk_latency_ns: 0,
            network_latency_ns: 0,
            timestamp,
        }
    }

    /// Read plus write latency.
    pub fn combined_latency_ns(&self) -> u64 {
        self.read_latency_ns.saturating_add(self.write_latency_ns)
    }

    pub fn combined_iops(&self) -> f64 {
        self.read_iops + self.write_iops
    }

    pub fn combined_throughput_bps(&self) -> f64 {
        self.read_throughput_bps + self.write_throughput_bps
    }
}
