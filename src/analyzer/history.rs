use std::collections::VecDeque;

use dashmap::DashMap;

use crate::monitor::snapshot::EntitySnapshot;
use crate::tracer::event::EntityId;

/// Per-entity bounded snapshot history.
///
/// Uses `DashMap` so appends for different entities contend only on their
/// shard. Every read returns an owned copy.
pub struct HistoryStore {
    capacity: usize,
    entries: DashMap<EntityId, VecDeque<EntitySnapshot>>,
}

impl HistoryStore {
    /// Creates a store keeping at most `capacity` snapshots per entity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::with_capacity(64),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends to the entity's tail, evicting from the head past capacity.
    ///
    /// A timestamp earlier than the current tail is clamped to the tail's,
    /// so entries stay non-decreasing when the wall clock steps back.
    pub fn append(&self, entity: &EntityId, mut snapshot: EntitySnapshot) {
        let mut history = self
            .entries
            .entry(EntityId::clone(entity))
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if let Some(tail) = history.back() {
            if snapshot.timestamp < tail.timestamp {
                snapshot.timestamp = tail.timestamp;
            }
        }

        history.push_back(snapshot);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Most recent snapshot for the entity.
    pub fn latest(&self, entity: &str) -> Option<EntitySnapshot> {
        self.entries
            .get(entity)
            .and_then(|history| history.back().cloned())
    }

    /// Copy of the entity's history, oldest first. Empty if unknown.
    pub fn all(&self, entity: &str) -> Vec<EntitySnapshot> {
        self.entries
            .get(entity)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, entity: &str) -> usize {
        self.entries.get(entity).map_or(0, |history| history.len())
    }

    /// True when no entity has history.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entities with at least one snapshot.
    pub fn entities(&self) -> Vec<EntityId> {
        self.entries
            .iter()
            .map(|entry| EntityId::clone(entry.key()))
            .collect()
    }

    /// Drops the history of entities for which `keep` returns false.
    /// Returns how many were dropped.
    pub fn retain(&self, keep: impl Fn(&EntityId) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entity, _| keep(entity));
        before.saturating_sub(self.entries.len())
    }
}
