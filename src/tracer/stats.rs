use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{ProbeEvent, ProbeKind, MAX_PROBE_KIND};

/// Events and payload bytes seen for one probe kind since the last drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeCount {
    pub probe: ProbeKind,
    pub events: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct Slot {
    events: AtomicU64,
    bytes: AtomicU64,
}

/// Intake counters indexed by probe code, drained by the periodic reporter.
pub struct EventStats {
    slots: [Slot; MAX_PROBE_KIND + 1],
}

impl EventStats {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::default()),
        }
    }

    #[inline]
    pub fn record(&self, event: &ProbeEvent) {
        if let Some(slot) = self.slots.get(event.probe as usize) {
            slot.events.fetch_add(1, Ordering::Relaxed);
            slot.bytes.fetch_add(event.bytes, Ordering::Relaxed);
        }
    }

    /// Reads and resets every counter. Probe kinds with no events are omitted.
    pub fn drain(&self) -> Vec<ProbeCount> {
        ProbeKind::all()
            .iter()
            .filter_map(|&probe| {
                let slot = self.slots.get(probe as usize)?;
                let events = slot.events.swap(0, Ordering::Relaxed);
                let bytes = slot.bytes.swap(0, Ordering::Relaxed);
                (events > 0).then_some(ProbeCount {
                    probe,
                    events,
                    bytes,
                })
            })
            .collect()
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
