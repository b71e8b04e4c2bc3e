use std::sync::atomic::{AtomicU64, Ordering};

use crate::tracer::event::{CompletedOperation, OpKind, Stage};

/// Snapshot field fed by a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    Read = 0,
    Write = 1,
    Queue = 2,
    Disk = 3,
    Network = 4,
}

/// Number of [`Slot`] values.
pub const SLOT_COUNT: usize = 5;

impl Slot {
    /// Syscall completions feed read/write; the other stages feed their
    /// latency component regardless of direction.
    pub const fn for_operation(stage: Stage, op: OpKind) -> Self {
        match (stage, op) {
            (Stage::Syscall, OpKind::Read) => Self::Read,
            (Stage::Syscall, OpKind::Write) => Self::Write,
            (Stage::Queue, _) => Self::Queue,
            (Stage::Device, _) => Self::Disk,
            (Stage::Remote, _) => Self::Network,
        }
    }
}

/// Lock-free counters for one slot within one window.
pub struct SlotCounter {
    ops: AtomicU64,
    bytes: AtomicU64,
    latency_sum_ns: AtomicU64,
    last_latency_ns: AtomicU64,
    last_completed_ns: AtomicU64,
}

/// Point-in-time values of a [`SlotCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotTotals {
    pub ops: u64,
    pub bytes: u64,
    pub latency_sum_ns: u64,
    /// Duration of the most recently completed operation.
    pub last_latency_ns: u64,
}

impl SlotCounter {
    pub fn new() -> Self {
        Self {
            ops: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            latency_sum_ns: AtomicU64::new(0),
            last_latency_ns: AtomicU64::new(0),
            last_completed_ns: AtomicU64::new(0),
        }
    }

    /// Records one completion. The last latency tracks the completion with the
    /// greatest timestamp, so out-of-order delivery does not roll it back.
    pub fn record(&self, duration_ns: u64, bytes: u64, completed_ns: u64) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.latency_sum_ns.fetch_add(duration_ns, Ordering::Relaxed);

        // CAS loop keeps the newest completion.
        loop {
            let newest = self.last_completed_ns.load(Ordering::Relaxed);
            if completed_ns < newest {
                return;
            }
            if self
                .last_completed_ns
                .compare_exchange_weak(newest, completed_ns, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.last_latency_ns.store(duration_ns, Ordering::Relaxed);
    }

    pub fn totals(&self) -> SlotTotals {
        SlotTotals {
            ops: self.ops.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            latency_sum_ns: self.latency_sum_ns.load(Ordering::Relaxed),
            last_latency_ns: self.last_latency_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for SlotCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// All slot counters of one entity within one window.
#[derive(Default)]
pub struct EntityCounters {
    slots: [SlotCounter; SLOT_COUNT],
}

/// Point-in-time values of [`EntityCounters`], indexed by [`Slot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityTotals {
    pub slots: [SlotTotals; SLOT_COUNT],
}

impl EntityTotals {
    pub fn slot(&self, slot: Slot) -> &SlotTotals {
        &self.slots[slot as usize]
    }
}

impl EntityCounters {
    pub fn record(&self, op: &CompletedOperation) {
        let slot = Slot::for_operation(op.stage, op.op);
        self.slots[slot as usize].record(op.duration_ns, op.bytes, op.completed_ns);
    }

    pub fn totals(&self) -> EntityTotals {
        EntityTotals {
            slots: std::array::from_fn(|i| self.slots[i].totals()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::EntityId;

    fn op(stage: Stage, kind: OpKind, duration_ns: u64, bytes: u64, at: u64) -> CompletedOperation {
        CompletedOperation {
            entity: EntityId::from("web-0"),
            op: kind,
            stage,
            duration_ns,
            bytes,
            completed_ns: at,
        }
    }

    #[test]
    fn test_slot_mapping() {
        assert_eq!(Slot::for_operation(Stage::Syscall, OpKind::Read), Slot::Read);
        assert_eq!(Slot::for_operation(Stage::Syscall, OpKind::Write), Slot::Write);
        assert_eq!(Slot::for_operation(Stage::Queue, OpKind::Write), Slot::Queue);
        assert_eq!(Slot::for_operation(Stage::Device, OpKind::Read), Slot::Disk);
        assert_eq!(Slot::for_operation(Stage::Remote, OpKind::Read), Slot::Network);
    }

    #[test]
    fn test_record_accumulates_and_keeps_last() {
        let c = EntityCounters::default();
        c.record(&op(Stage::Syscall, OpKind::Read, 100, 4096, 10));
        c.record(&op(Stage::Syscall, OpKind::Read, 300, 4096, 20));
        c.record(&op(Stage::Device, OpKind::Read, 50, 4096, 15));

        let t = c.totals();
        let read = t.slot(Slot::Read);
        assert_eq!(read.ops, 2);
        assert_eq!(read.bytes, 8192);
        assert_eq!(read.latency_sum_ns, 400);
        assert_eq!(read.last_latency_ns, 300);
        assert_eq!(t.slot(Slot::Disk).last_latency_ns, 50);
        assert_eq!(t.slot(Slot::Write).ops, 0);
    }

    #[test]
    fn test_out_of_order_completion_does_not_roll_back_last() {
        let c = SlotCounter::new();
        c.record(500, 0, 200);
        c.record(100, 0, 100);

        let t = c.totals();
        assert_eq!(t.ops, 2);
        assert_eq!(t.last_latency_ns, 500);
    }
}
