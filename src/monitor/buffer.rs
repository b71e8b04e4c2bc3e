use std::time::Instant;

use dashmap::DashMap;

use super::counters::{EntityCounters, EntityTotals};
use crate::tracer::event::{CompletedOperation, EntityId};

/// Completed-operation counters for one aggregation window.
///
/// Uses `DashMap` so the collector records without a global lock while the
/// aggregation task reads a rotated-out window.
pub struct WindowBuffer {
    /// Monotonic start of this window, used for rate computation.
    pub started: Instant,
    entities: DashMap<EntityId, EntityCounters>,
}

impl WindowBuffer {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            entities: DashMap::with_capacity(64),
        }
    }

    #[inline(always)]
    pub fn record(&self, op: &CompletedOperation) {
        if let Some(counters) = self.entities.get(&op.entity) {
            counters.record(op);
            return;
        }
        self.entities
            .entry(EntityId::clone(&op.entity))
            .or_default()
            .record(op);
    }

    /// Totals of every entity with at least one completion.
    pub fn totals(&self) -> Vec<(EntityId, EntityTotals)> {
        self.entities
            .iter()
            .map(|entry| (EntityId::clone(entry.key()), entry.value().totals()))
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

impl Default for WindowBuffer {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

/// Atomic window holder with lock-free swap.
mod atomic_buffer {
    use std::sync::Arc;

    use arc_swap::ArcSwapOption;

    use super::WindowBuffer;

    /// Lock-free loads for the collector, swaps for rotation.
    pub struct AtomicBuffer {
        inner: ArcSwapOption<WindowBuffer>,
    }

    impl AtomicBuffer {
        pub fn new() -> Self {
            Self {
                inner: ArcSwapOption::empty(),
            }
        }

        pub fn store(&self, buf: WindowBuffer) {
            self.inner.store(Some(Arc::new(buf)));
        }

        pub fn load(&self) -> Option<Arc<WindowBuffer>> {
            self.inner.load_full()
        }

        /// Swaps in a new window, returning the old one.
        pub fn swap(&self, new_buf: WindowBuffer) -> Option<Arc<WindowBuffer>> {
            self.inner.swap(Some(Arc::new(new_buf)))
        }

        /// Takes the window out, leaving None.
        pub fn take(&self) -> Option<Arc<WindowBuffer>> {
            self.inner.swap(None)
        }
    }

    impl Default for AtomicBuffer {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub use atomic_buffer::AtomicBuffer;
