//! Per-entity history and derived analysis.
//!
//! The aggregation task is the single writer: each cycle's snapshots are
//! appended to history, classified and scored, and the results are published
//! as one immutable [`CycleView`] through an atomic pointer swap. Readers
//! load the current view and never see classification computed from a
//! different snapshot set than the latest they observe.

pub mod anomaly;
pub mod bottleneck;
pub mod history;
pub mod trend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use thiserror::Error;

use self::anomaly::AnomalyParams;
use self::bottleneck::{BottleneckType, Thresholds};
use self::history::HistoryStore;
use self::trend::{RankBy, Trend};
use crate::config::AnalyzerConfig;
use crate::monitor::snapshot::EntitySnapshot;
use crate::tracer::event::EntityId;

/// Errors returned by analysis queries.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("insufficient data for {entity}: have {have} snapshots, need {need}")]
    InsufficientData {
        entity: String,
        have: usize,
        need: usize,
    },
}

/// Results of one aggregation cycle, published atomically.
#[derive(Debug, Default, Clone)]
pub struct CycleView {
    /// Number of cycles applied so far.
    pub cycle: u64,
    latest: HashMap<EntityId, EntitySnapshot>,
    bottlenecks: HashMap<EntityId, BottleneckType>,
    anomalies: HashMap<EntityId, bool>,
}

impl CycleView {
    pub fn latest(&self, entity: &str) -> Option<&EntitySnapshot> {
        self.latest.get(entity)
    }

    pub fn bottleneck(&self, entity: &str) -> BottleneckType {
        self.bottlenecks.get(entity).copied().unwrap_or_default()
    }

    pub fn anomaly(&self, entity: &str) -> bool {
        self.anomalies.get(entity).copied().unwrap_or(false)
    }

    pub fn summary(&self) -> AnalysisSummary {
        let mut bottlenecks = BottleneckType::all().map(|b| (b, 0usize));
        for kind in self.bottlenecks.values() {
            if let Some(slot) = bottlenecks.iter_mut().find(|(b, _)| b == kind) {
                slot.1 += 1;
            }
        }
        AnalysisSummary {
            cycle: self.cycle,
            entities: self.latest.len(),
            anomalies: self.anomalies.values().filter(|a| **a).count(),
            bottlenecks,
        }
    }
}

/// Entity, anomaly and bottleneck counts for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub cycle: u64,
    pub entities: usize,
    pub anomalies: usize,
    pub bottlenecks: [(BottleneckType, usize); 5],
}

impl AnalysisSummary {
    pub fn count(&self, kind: BottleneckType) -> usize {
        self.bottlenecks
            .iter()
            .find(|(b, _)| *b == kind)
            .map_or(0, |(_, n)| *n)
    }
}

/// History store plus the published analysis results.
pub struct Analyzer {
    history: HistoryStore,
    thresholds: Thresholds,
    anomaly: AnomalyParams,
    trend_change_percent: f64,
    view: ArcSwap<CycleView>,
}

impl Analyzer {
    pub fn new(cfg: &AnalyzerConfig) -> Self {
        Self {
            history: HistoryStore::new(cfg.history_capacity),
            thresholds: Thresholds::from(cfg.thresholds),
            anomaly: AnomalyParams::from(cfg.anomaly),
            trend_change_percent: cfg.trend_change_percent,
            view: ArcSwap::from_pointee(CycleView::default()),
        }
    }

    /// Appends one cycle's snapshots, recomputes classification and anomaly
    /// state for each, and publishes the new view.
    ///
    /// Entities absent from the batch keep their previous results.
    pub fn apply_cycle(&self, snapshots: Vec<EntitySnapshot>) -> Arc<CycleView> {
        let mut next = CycleView::clone(&self.view.load());
        next.cycle += 1;

        for snapshot in snapshots {
            let entity = EntityId::clone(&snapshot.entity);
            self.history.append(&entity, snapshot);

            let history = self.history.all(&entity);
            let Some(latest) = history.last() else {
                continue;
            };

            let kind = bottleneck::classify(latest, &self.thresholds);
            let anomalous = anomaly::detect(&history, &self.anomaly);

            next.bottlenecks.insert(EntityId::clone(&entity), kind);
            next.anomalies.insert(EntityId::clone(&entity), anomalous);
            next.latest.insert(entity, latest.clone());
        }

        let next = Arc::new(next);
        self.view.store(Arc::clone(&next));
        next
    }

    /// Current published view.
    pub fn view(&self) -> Arc<CycleView> {
        self.view.load_full()
    }

    pub fn get_snapshot(&self, entity: &str) -> Option<EntitySnapshot> {
        self.view.load().latest(entity).cloned()
    }

    /// Latest snapshot of every entity.
    pub fn get_all_snapshots(&self) -> HashMap<EntityId, EntitySnapshot> {
        self.view.load().latest.clone()
    }

    /// Bottleneck of the entity's latest snapshot, `Unknown` before any data.
    pub fn get_bottleneck(&self, entity: &str) -> BottleneckType {
        self.view.load().bottleneck(entity)
    }

    pub fn has_anomaly(&self, entity: &str) -> bool {
        self.view.load().anomaly(entity)
    }

    /// Latency trend over `window` ending now.
    pub fn get_trend(&self, entity: &str, window: Duration) -> Result<Trend, AnalysisError> {
        self.get_trend_at(entity, window, SystemTime::now())
    }

    /// Latency trend over `window` ending at `now`.
    pub fn get_trend_at(
        &self,
        entity: &str,
        window: Duration,
        now: SystemTime,
    ) -> Result<Trend, AnalysisError> {
        let history = self.history.all(entity);
        trend::trend(&history, window, now, self.trend_change_percent).ok_or_else(|| {
            AnalysisError::InsufficientData {
                entity: entity.to_string(),
                have: history.len(),
                need: 2,
            }
        })
    }

    /// The `n` entities with the highest combined latency.
    pub fn get_top_n(&self, n: usize) -> Vec<EntitySnapshot> {
        self.get_top_n_by(n, RankBy::Latency)
    }

    pub fn get_top_n_by(&self, n: usize, by: RankBy) -> Vec<EntitySnapshot> {
        let snapshots = self.view.load().latest.values().cloned().collect();
        trend::rank(snapshots, n, by)
    }

    /// Copy of the entity's retained history, oldest first.
    pub fn get_history(&self, entity: &str) -> Vec<EntitySnapshot> {
        self.history.all(entity)
    }

    pub fn summary(&self) -> AnalysisSummary {
        self.view.load().summary()
    }

    /// Drops history and results of entities for which `keep` returns false.
    /// Returns the number of entities retired. The view is republished only
    /// when something was dropped.
    pub fn retain(&self, keep: impl Fn(&EntityId) -> bool) -> usize {
        let retired = self.history.retain(&keep);
        if retired == 0 {
            return 0;
        }

        let mut next = CycleView::clone(&self.view.load());
        next.latest.retain(|entity, _| keep(entity));
        next.bottlenecks.retain(|entity, _| keep(entity));
        next.anomalies.retain(|entity, _| keep(entity));
        self.view.store(Arc::new(next));
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn snap(entity: &str, secs: u64, read: u64, write: u64) -> EntitySnapshot {
        let mut s = EntitySnapshot::empty(
            Arc::from(entity),
            Arc::from("shop"),
            SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        );
        s.read_latency_ns = read;
        s.write_latency_ns = write;
        s
    }

    fn analyzer() -> Analyzer {
        Analyzer::new(&AnalyzerConfig::default())
    }

    #[test]
    fn test_defaults_before_data() {
        let a = analyzer();
        assert!(a.get_snapshot("web-0").is_none());
        assert_eq!(a.get_bottleneck("web-0"), BottleneckType::Unknown);
        assert!(!a.has_anomaly("web-0"));
        assert!(a.get_all_snapshots().is_empty());
        assert!(a.get_top_n(3).is_empty());
        assert_eq!(a.summary().entities, 0);
    }

    #[test]
    fn test_apply_cycle_publishes_results() {
        let a = analyzer();
        let mut disk_bound = snap("db-0", 10, 30 * MS, 0);
        disk_bound.disk_latency_ns = 25 * MS;
        let view = a.apply_cycle(vec![disk_bound, snap("web-0", 10, MS, MS)]);

        assert_eq!(view.cycle, 1);
        assert_eq!(a.get_bottleneck("db-0"), BottleneckType::Disk);
        assert_eq!(a.get_bottleneck("web-0"), BottleneckType::None);
        assert_eq!(
            a.get_snapshot("db-0").map(|s| s.read_latency_ns),
            Some(30 * MS)
        );

        let summary = a.summary();
        assert_eq!(summary.entities, 2);
        assert_eq!(summary.count(BottleneckType::Disk), 1);
        assert_eq!(summary.count(BottleneckType::None), 1);
        assert_eq!(summary.anomalies, 0);
    }

    #[test]
    fn test_absent_entity_keeps_previous_results() {
        let a = analyzer();
        a.apply_cycle(vec![snap("a", 10, 50 * MS, 0), snap("b", 10, MS, 0)]);
        a.apply_cycle(vec![snap("b", 20, 2 * MS, 0)]);

        assert_eq!(a.get_bottleneck("a"), BottleneckType::Unknown);
        assert_eq!(a.get_history("a").len(), 1);
        assert_eq!(a.get_history("b").len(), 2);
        assert_eq!(a.summary().cycle, 2);
    }

    #[test]
    fn test_anomaly_flag_follows_history() {
        let a = analyzer();
        for i in 0..10 {
            a.apply_cycle(vec![snap("db-0", i * 10, 4 * MS, MS)]);
        }
        assert!(!a.has_anomaly("db-0"));

        a.apply_cycle(vec![snap("db-0", 100, 40 * MS, MS)]);
        assert!(a.has_anomaly("db-0"));
        assert_eq!(a.summary().anomalies, 1);
    }

    #[test]
    fn test_trend_insufficient_data() {
        let a = analyzer();
        a.apply_cycle(vec![snap("web-0", 0, MS, MS)]);

        let err = a
            .get_trend("web-0", Duration::from_secs(300))
            .expect_err("one snapshot is not enough");
        assert_eq!(
            err,
            AnalysisError::InsufficientData {
                entity: "web-0".to_string(),
                have: 1,
                need: 2,
            }
        );
        assert!(err.to_string().contains("have 1"));
        assert!(a.get_trend("ghost", Duration::from_secs(300)).is_err());
    }

    #[test]
    fn test_trend_at() {
        let a = analyzer();
        a.apply_cycle(vec![snap("web-0", 0, 10 * MS, 10 * MS)]);
        a.apply_cycle(vec![snap("web-0", 300, 15 * MS, 10 * MS)]);

        let t = a
            .get_trend_at(
                "web-0",
                Duration::from_secs(300),
                SystemTime::UNIX_EPOCH + Duration::from_secs(300),
            )
            .expect("trend");
        assert_eq!(t.direction, trend::TrendDirection::Increased);
        assert!((t.change_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_top_n_uses_latest_snapshots() {
        let a = analyzer();
        a.apply_cycle(vec![
            snap("a", 10, 5 * MS, 0),
            snap("b", 10, 30 * MS, 0),
            snap("c", 10, 12 * MS, 0),
        ]);
        let names: Vec<String> = a.get_top_n(2).iter().map(|s| s.entity.to_string()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_reads_are_independent_copies() {
        let a = analyzer();
        a.apply_cycle(vec![snap("a", 10, 5 * MS, 0)]);

        let mut all = a.get_all_snapshots();
        if let Some(s) = all.get_mut("a") {
            s.read_latency_ns = 0;
        }
        assert_eq!(a.get_snapshot("a").map(|s| s.read_latency_ns), Some(5 * MS));
    }

    #[test]
    fn test_held_view_is_stable_across_cycles() {
        let a = analyzer();
        a.apply_cycle(vec![snap("a", 10, 5 * MS, 0)]);
        let held = a.view();

        a.apply_cycle(vec![snap("a", 20, 50 * MS, 0)]);
        assert_eq!(held.latest("a").map(|s| s.read_latency_ns), Some(5 * MS));
        assert_eq!(held.bottleneck("a"), BottleneckType::None);
        assert_eq!(a.get_bottleneck("a"), BottleneckType::Unknown);
    }

    #[test]
    fn test_retain_retires_entities() {
        let a = analyzer();
        a.apply_cycle(vec![snap("a", 10, MS, 0), snap("b", 10, MS, 0)]);
        assert_eq!(a.retain(|e| &**e == "a"), 1);
        assert_eq!(a.retain(|e| &**e == "a"), 0);

        assert!(a.get_snapshot("b").is_none());
        assert!(a.get_history("b").is_empty());
        assert_eq!(a.summary().entities, 1);
    }
}
