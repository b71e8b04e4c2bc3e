//! Conversion of window counters into per-entity rate snapshots.
//!
//! Rates divide the window's op and byte counts by the elapsed time since
//! the previous collection. Latency fields report the most recent observed
//! completion for each stage, not an average. A stage with no completions
//! in the window either carries the prior value or reports zero, depending
//! on the configured [`IdleLatency`] policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::counters::{EntityTotals, Slot, SLOT_COUNT};
use super::snapshot::EntitySnapshot;
use crate::config::IdleLatency;
use crate::directory::EntityInfo;
use crate::tracer::event::EntityId;

/// Elapsed time below this is treated as one second.
const MIN_ELAPSED_SECS: f64 = 0.001;

/// Seconds used as the rate denominator for `elapsed`.
pub fn rate_seconds(elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs < MIN_ELAPSED_SECS {
        1.0
    } else {
        secs
    }
}

/// Builds one snapshot per entity per cycle.
pub struct Aggregator {
    idle: IdleLatency,
    default_namespace: Arc<str>,
    carry: HashMap<EntityId, [u64; SLOT_COUNT]>,
}

impl Aggregator {
    pub fn new(idle: IdleLatency, default_namespace: &str) -> Self {
        Self {
            idle,
            default_namespace: Arc::from(default_namespace),
            carry: HashMap::with_capacity(64),
        }
    }

    /// Snapshots for every listed entity plus every entity active in the
    /// window, sorted by entity name and timestamped `now`.
    pub fn aggregate(
        &mut self,
        window: &[(EntityId, EntityTotals)],
        listed: &[EntityInfo],
        elapsed: Duration,
        now: SystemTime,
    ) -> Vec<EntitySnapshot> {
        let secs = rate_seconds(elapsed);

        let mut namespaces: HashMap<&EntityId, &Arc<str>> =
            HashMap::with_capacity(listed.len());
        for info in listed {
            namespaces.entry(&info.name).or_insert(&info.namespace);
        }

        let active: HashMap<&EntityId, &EntityTotals> =
            window.iter().map(|(id, totals)| (id, totals)).collect();

        let mut entities: Vec<&EntityId> = namespaces.keys().copied().collect();
        for id in active.keys() {
            if !namespaces.contains_key(*id) {
                entities.push(*id);
            }
        }
        entities.sort();

        let idle = EntityTotals::default();
        let mut carry = HashMap::with_capacity(entities.len());
        let mut snapshots = Vec::with_capacity(entities.len());

        for id in entities {
            let totals = active.get(id).copied().unwrap_or(&idle);
            let namespace = namespaces
                .get(id)
                .map_or_else(|| Arc::clone(&self.default_namespace), |ns| Arc::clone(*ns));

            let prior = self.carry.get(id).copied().unwrap_or_default();
            let latency: [u64; SLOT_COUNT] = std::array::from_fn(|i| {
                let slot = &totals.slots[i];
                if slot.ops > 0 {
                    slot.last_latency_ns
                } else {
                    match self.idle {
                        IdleLatency::Retain => prior[i],
                        IdleLatency::Reset => 0,
                    }
                }
            });

            let read = totals.slot(Slot::Read);
            let write = totals.slot(Slot::Write);

            snapshots.push(EntitySnapshot {
                entity: EntityId::clone(id),
                namespace,
                read_latency_ns: latency[Slot::Read as usize],
                write_latency_ns: latency[Slot::Write as usize],
                read_iops: read.ops as f64 / secs,
                write_iops: write.ops as f64 / secs,
                read_throughput_bps: read.bytes as f64 / secs,
                write_throughput_bps: write.bytes as f64 / secs,
                queue_latency_ns: latency[Slot::Queue as usize],
                disk_latency_ns: latency[Slot::Disk as usize],
                network_latency_ns: latency[Slot::Network as usize],
                timestamp: now,
            });
            carry.insert(EntityId::clone(id), latency);
        }

        // Entities neither listed nor active drop out here.
        self.carry = carry;
        snapshots
    }

    /// Entities with carried latency state.
    pub fn tracked(&self) -> usize {
        self.carry.len()
    }
}
