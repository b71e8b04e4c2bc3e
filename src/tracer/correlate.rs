//! Start/end pairing of probe events into completed operations.
//!
//! Each stage of an I/O path opens with a start probe and closes with an
//! end probe. Pending starts are held in a table keyed by stage plus either
//! the kernel request handle (block and remote probes) or the calling task
//! (VFS probes). A completion consumes its start at most once. Completions
//! without a start are dropped, and starts older than the pending horizon
//! relative to the newest observed timestamp are swept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::event::{CompletedOperation, Edge, OpKind, ProbeEvent, RawIoEvent, Stage};

/// Identifier of one in-flight operation within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKey {
    /// Kernel per-request handle.
    Request(u64),
    /// Calling thread plus the wrapper it entered.
    Task { tid: u32, site: OpKind },
}

impl OpKey {
    fn for_event(event: &ProbeEvent) -> Self {
        if event.probe.is_task_scoped() {
            Self::Task {
                tid: event.tid,
                site: event.op,
            }
        } else {
            Self::Request(event.handle)
        }
    }
}

/// Outcome counters for correlation, drained each aggregation cycle.
#[derive(Default)]
pub struct CorrelationStats {
    matched: AtomicU64,
    unmatched: AtomicU64,
    expired: AtomicU64,
    overflow: AtomicU64,
    replaced: AtomicU64,
    unattributed: AtomicU64,
    skewed: AtomicU64,
}

/// Point-in-time view of [`CorrelationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationSnapshot {
    pub matched: u64,
    pub unmatched: u64,
    pub expired: u64,
    pub overflow: u64,
    pub replaced: u64,
    pub unattributed: u64,
    pub skewed: u64,
}

impl CorrelationStats {
    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> CorrelationSnapshot {
        CorrelationSnapshot {
            matched: self.matched.swap(0, Ordering::Relaxed),
            unmatched: self.unmatched.swap(0, Ordering::Relaxed),
            expired: self.expired.swap(0, Ordering::Relaxed),
            overflow: self.overflow.swap(0, Ordering::Relaxed),
            replaced: self.replaced.swap(0, Ordering::Relaxed),
            unattributed: self.unattributed.swap(0, Ordering::Relaxed),
            skewed: self.skewed.swap(0, Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pairs start and end probe events. Owned by a single collector task.
pub struct Correlator {
    pending: HashMap<(Stage, OpKey), RawIoEvent>,
    horizon_ns: u64,
    max_pending: usize,
    watermark_ns: u64,
    stats: Arc<CorrelationStats>,
}

impl Correlator {
    /// Creates a correlator evicting starts older than `horizon` and holding
    /// at most `max_pending` starts.
    pub fn new(horizon: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::with_capacity(max_pending.min(4096)),
            horizon_ns: u64::try_from(horizon.as_nanos()).unwrap_or(u64::MAX),
            max_pending,
            watermark_ns: 0,
            stats: Arc::new(CorrelationStats::default()),
        }
    }

    /// Shared handle to the outcome counters.
    pub fn stats(&self) -> Arc<CorrelationStats> {
        Arc::clone(&self.stats)
    }

    /// Number of starts awaiting completion.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Largest event timestamp seen so far.
    pub fn watermark_ns(&self) -> u64 {
        self.watermark_ns
    }

    /// Feeds one probe event. Returns the operation it completed, if any.
    pub fn observe(&mut self, event: &ProbeEvent) -> Option<CompletedOperation> {
        self.watermark_ns = self.watermark_ns.max(event.timestamp_ns);
        let key = OpKey::for_event(event);

        let mut completed = None;
        for (stage, edge) in event.probe.transitions() {
            match edge {
                Edge::Start => self.start(*stage, key, event),
                Edge::End => {
                    if let Some(op) = self.complete(*stage, key, event) {
                        completed = Some(op);
                    }
                }
            }
        }
        completed
    }

    /// Drops starts older than the pending horizon. Returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        let cutoff = self.watermark_ns.saturating_sub(self.horizon_ns);
        let before = self.pending.len();
        self.pending.retain(|_, start| start.start_ns >= cutoff);
        let expired = before - self.pending.len();
        if expired > 0 {
            self.stats
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
        expired
    }

    fn start(&mut self, stage: Stage, key: OpKey, event: &ProbeEvent) {
        let entry = RawIoEvent {
            entity: event.entity.clone(),
            op: event.op,
            start_ns: event.timestamp_ns,
            end_ns: None,
            bytes: event.bytes,
        };

        if let Some(slot) = self.pending.get_mut(&(stage, key)) {
            *slot = entry;
            CorrelationStats::bump(&self.stats.replaced);
            return;
        }

        if self.pending.len() >= self.max_pending {
            self.sweep();
            if self.pending.len() >= self.max_pending {
                CorrelationStats::bump(&self.stats.overflow);
                return;
            }
        }

        self.pending.insert((stage, key), entry);
    }

    fn complete(
        &mut self,
        stage: Stage,
        key: OpKey,
        event: &ProbeEvent,
    ) -> Option<CompletedOperation> {
        let Some(mut start) = self.pending.remove(&(stage, key)) else {
            CorrelationStats::bump(&self.stats.unmatched);
            return None;
        };

        if event.timestamp_ns < start.start_ns {
            CorrelationStats::bump(&self.stats.skewed);
            return None;
        }
        start.end_ns = Some(event.timestamp_ns);

        // Block completions fire in interrupt context, so the issuing side
        // owns the identity.
        let Some(entity) = start.entity.take().or_else(|| event.entity.clone()) else {
            CorrelationStats::bump(&self.stats.unattributed);
            return None;
        };

        CorrelationStats::bump(&self.stats.matched);
        Some(CompletedOperation {
            entity,
            op: start.op,
            stage,
            duration_ns: event.timestamp_ns - start.start_ns,
            bytes: if event.bytes != 0 {
                event.bytes
            } else {
                start.bytes
            },
            completed_ns: event.timestamp_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::{EntityId, ProbeKind};

    fn event(ts: u64, probe: ProbeKind, handle: u64, entity: Option<&str>) -> ProbeEvent {
        ProbeEvent {
            timestamp_ns: ts,
            pid: 100,
            tid: 101,
            cgroup_id: 0,
            probe,
            op: probe.implied_op().unwrap_or(OpKind::Read),
            handle,
            bytes: 0,
            entity: entity.map(EntityId::from),
        }
    }

    fn correlator() -> Correlator {
        Correlator::new(Duration::from_secs(30), 16)
    }

    #[test]
    fn test_vfs_pair_emits_duration() {
        let mut c = correlator();
        assert!(c
            .observe(&event(1_000, ProbeKind::VfsReadEntry, 0, Some("web-0")))
            .is_none());

        let mut exit = event(4_000, ProbeKind::VfsReadExit, 0, Some("web-0"));
        exit.bytes = 8192;
        let op = c.observe(&exit).expect("exit should complete the read");

        assert_eq!(&*op.entity, "web-0");
        assert_eq!(op.stage, Stage::Syscall);
        assert_eq!(op.op, OpKind::Read);
        assert_eq!(op.duration_ns, 3_000);
        assert_eq!(op.bytes, 8192);
        assert_eq!(op.completed_ns, 4_000);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn test_completion_without_start_is_dropped() {
        let mut c = correlator();
        let stats = c.stats();

        assert!(c
            .observe(&event(10, ProbeKind::BlockRqComplete, 7, Some("web-0")))
            .is_none());

        let snap = stats.snapshot();
        assert_eq!(snap.unmatched, 1);
        assert_eq!(snap.matched, 0);
    }

    #[test]
    fn test_completion_emits_at_most_once() {
        let mut c = correlator();
        c.observe(&event(10, ProbeKind::RemoteIssue, 7, Some("db-0")));
        assert!(c
            .observe(&event(20, ProbeKind::RemoteComplete, 7, None))
            .is_some());
        assert!(c
            .observe(&event(30, ProbeKind::RemoteComplete, 7, None))
            .is_none());
    }

    #[test]
    fn test_block_request_produces_queue_then_device() {
        let mut c = correlator();
        c.observe(&event(1_000, ProbeKind::BlockRqInsert, 0xabc, Some("db-0")));

        let queue = c
            .observe(&event(1_600, ProbeKind::BlockRqIssue, 0xabc, Some("db-0")))
            .expect("issue should close the queue stage");
        assert_eq!(queue.stage, Stage::Queue);
        assert_eq!(queue.duration_ns, 600);

        let device = c
            .observe(&event(5_600, ProbeKind::BlockRqComplete, 0xabc, None))
            .expect("complete should close the device stage");
        assert_eq!(device.stage, Stage::Device);
        assert_eq!(device.duration_ns, 4_000);
        assert_eq!(&*device.entity, "db-0");
    }

    #[test]
    fn test_issue_without_insert_still_opens_device_stage() {
        let mut c = correlator();
        assert!(c
            .observe(&event(100, ProbeKind::BlockRqIssue, 1, Some("db-0")))
            .is_none());
        let op = c
            .observe(&event(400, ProbeKind::BlockRqComplete, 1, None))
            .expect("device stage should match");
        assert_eq!(op.duration_ns, 300);
    }

    #[test]
    fn test_completion_entity_is_fallback() {
        let mut c = correlator();
        c.observe(&event(0, ProbeKind::RemoteIssue, 3, None));
        let op = c
            .observe(&event(50, ProbeKind::RemoteComplete, 3, Some("late")))
            .expect("should match");
        assert_eq!(&*op.entity, "late");
    }

    #[test]
    fn test_pair_without_identity_is_unattributed() {
        let mut c = correlator();
        let stats = c.stats();
        c.observe(&event(0, ProbeKind::RemoteIssue, 3, None));
        assert!(c
            .observe(&event(50, ProbeKind::RemoteComplete, 3, None))
            .is_none());
        assert_eq!(stats.snapshot().unattributed, 1);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn test_end_before_start_is_skewed() {
        let mut c = correlator();
        let stats = c.stats();
        c.observe(&event(500, ProbeKind::RemoteIssue, 3, Some("a")));
        assert!(c
            .observe(&event(400, ProbeKind::RemoteComplete, 3, None))
            .is_none());
        assert_eq!(stats.snapshot().skewed, 1);
    }

    #[test]
    fn test_start_bytes_used_when_completion_has_none() {
        let mut c = correlator();
        let mut issue = event(0, ProbeKind::BlockRqIssue, 9, Some("a"));
        issue.bytes = 4096;
        c.observe(&issue);
        let op = c
            .observe(&event(10, ProbeKind::BlockRqComplete, 9, None))
            .expect("should match");
        assert_eq!(op.bytes, 4096);
    }

    #[test]
    fn test_second_start_replaces_first() {
        let mut c = correlator();
        let stats = c.stats();
        c.observe(&event(100, ProbeKind::VfsWriteEntry, 0, Some("a")));
        c.observe(&event(300, ProbeKind::VfsWriteEntry, 0, Some("a")));
        let op = c
            .observe(&event(350, ProbeKind::VfsWriteExit, 0, None))
            .expect("should match");
        assert_eq!(op.duration_ns, 50);
        assert_eq!(stats.snapshot().replaced, 1);
    }

    #[test]
    fn test_vfs_keys_are_per_thread() {
        let mut c = correlator();
        let mut a = event(100, ProbeKind::VfsReadEntry, 0, Some("a"));
        a.tid = 1;
        let mut b = event(200, ProbeKind::VfsReadEntry, 0, Some("b"));
        b.tid = 2;
        c.observe(&a);
        c.observe(&b);

        let mut exit_b = event(260, ProbeKind::VfsReadExit, 0, None);
        exit_b.tid = 2;
        let op = c.observe(&exit_b).expect("thread 2 should match");
        assert_eq!(&*op.entity, "b");
        assert_eq!(op.duration_ns, 60);
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn test_sweep_expires_orphaned_starts() {
        let mut c = Correlator::new(Duration::from_nanos(1_000), 16);
        let stats = c.stats();
        c.observe(&event(0, ProbeKind::RemoteIssue, 1, Some("a")));
        c.observe(&event(900, ProbeKind::RemoteIssue, 2, Some("a")));
        c.observe(&event(1_500, ProbeKind::RemoteIssue, 3, Some("a")));

        assert_eq!(c.sweep(), 1);
        assert_eq!(c.pending_len(), 2);
        assert_eq!(stats.snapshot().expired, 1);

        // The expired start can no longer be matched.
        assert!(c
            .observe(&event(1_600, ProbeKind::RemoteComplete, 1, None))
            .is_none());
    }

    #[test]
    fn test_full_table_drops_new_starts() {
        let mut c = Correlator::new(Duration::from_secs(30), 2);
        let stats = c.stats();
        c.observe(&event(0, ProbeKind::RemoteIssue, 1, Some("a")));
        c.observe(&event(1, ProbeKind::RemoteIssue, 2, Some("a")));
        c.observe(&event(2, ProbeKind::RemoteIssue, 3, Some("a")));

        assert_eq!(c.pending_len(), 2);
        assert_eq!(stats.snapshot().overflow, 1);
    }

    #[test]
    fn test_full_table_sweeps_before_dropping() {
        let mut c = Correlator::new(Duration::from_nanos(100), 2);
        c.observe(&event(0, ProbeKind::RemoteIssue, 1, Some("a")));
        c.observe(&event(10, ProbeKind::RemoteIssue, 2, Some("a")));
        c.observe(&event(500, ProbeKind::RemoteIssue, 3, Some("a")));

        assert_eq!(c.pending_len(), 1);
        assert!(c
            .observe(&event(550, ProbeKind::RemoteComplete, 3, None))
            .is_some());
    }

    #[test]
    fn test_watermark_tracks_max_timestamp() {
        let mut c = correlator();
        c.observe(&event(500, ProbeKind::RemoteIssue, 1, Some("a")));
        c.observe(&event(200, ProbeKind::RemoteIssue, 2, Some("a")));
        assert_eq!(c.watermark_ns(), 500);
    }
}
