use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ioeye::analyzer::anomaly::{detect, AnomalyParams};
use ioeye::analyzer::bottleneck::{classify, BottleneckType, Thresholds};
use ioeye::analyzer::history::HistoryStore;
use ioeye::analyzer::trend::TrendDirection;
use ioeye::analyzer::{AnalysisError, Analyzer};
use ioeye::config::{AnalyzerConfig, ZScoreDenominator};
use ioeye::monitor::snapshot::EntitySnapshot;
use ioeye::tracer::correlate::Correlator;
use ioeye::tracer::event::{EntityId, OpKind, ProbeEvent, ProbeKind};
use ioeye::tracer::parse::{encode_event, parse_event, ParseError};

const MS: u64 = 1_000_000;

fn base_time() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn snapshot(entity: &str, at: SystemTime) -> EntitySnapshot {
    EntitySnapshot::empty(EntityId::from(entity), Arc::from("shop"), at)
}

fn latencies(read: u64, write: u64, queue: u64, disk: u64, network: u64) -> EntitySnapshot {
    let mut s = snapshot("web-0", base_time());
    s.read_latency_ns = read;
    s.write_latency_ns = write;
    s.queue_latency_ns = queue;
    s.disk_latency_ns = disk;
    s.network_latency_ns = network;
    s
}

/// Small deterministic generator for shuffled inputs.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn test_history_bounded_and_ordered_under_arbitrary_appends() {
    let mut rng = Lcg(7);
    for capacity in [1usize, 2, 5, 100] {
        let store = HistoryStore::new(capacity);
        let entity = EntityId::from("web-0");

        for _ in 0..500 {
            let at = base_time() + Duration::from_millis(rng.next() % 10_000);
            store.append(&entity, snapshot("web-0", at));

            let history = store.all("web-0");
            assert!(history.len() <= capacity);
            assert!(history
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp));
        }
        assert_eq!(store.len("web-0"), capacity);
    }
}

#[test]
fn test_classification_is_deterministic() {
    let thresholds = Thresholds::default();
    let mut rng = Lcg(11);
    for _ in 0..200 {
        let s = latencies(
            rng.next() % (30 * MS),
            rng.next() % (30 * MS),
            rng.next() % (10 * MS),
            rng.next() % (10 * MS),
            rng.next() % (10 * MS),
        );
        assert_eq!(classify(&s, &thresholds), classify(&s, &thresholds));
    }
}

#[test]
fn test_classification_examples() {
    let thresholds = Thresholds::default();
    assert_eq!(
        classify(&latencies(0, 0, 6 * MS, MS, MS), &thresholds),
        BottleneckType::Queue
    );
    assert_eq!(
        classify(&latencies(0, 0, MS, 8 * MS, 2 * MS), &thresholds),
        BottleneckType::Disk
    );
    assert_eq!(
        classify(&latencies(MS, MS, MS, MS, MS), &thresholds),
        BottleneckType::None
    );
}

fn spike_history(flat: usize) -> Vec<EntitySnapshot> {
    let mut history: Vec<EntitySnapshot> = (0..flat)
        .map(|i| {
            let mut s = snapshot("db-0", base_time() + Duration::from_secs(i as u64 * 10));
            s.read_latency_ns = MS;
            s
        })
        .collect();
    let mut spike = snapshot("db-0", base_time() + Duration::from_secs(flat as u64 * 10));
    spike.read_latency_ns = 10 * MS;
    history.push(spike);
    history
}

#[test]
fn test_spike_detected_with_std_dev_denominator() {
    let params = AnomalyParams::default();
    assert_eq!(params.denominator, ZScoreDenominator::StdDev);
    assert!(detect(&spike_history(10), &params));
}

#[test]
fn test_spike_not_detected_with_variance_denominator() {
    let params = AnomalyParams {
        denominator: ZScoreDenominator::Variance,
        ..AnomalyParams::default()
    };
    assert!(!detect(&spike_history(10), &params));
}

#[test]
fn test_short_history_never_anomalous() {
    let params = AnomalyParams::default();
    let mut rng = Lcg(3);
    let history: Vec<EntitySnapshot> = (0..9)
        .map(|_| {
            let mut s = snapshot("db-0", base_time());
            s.read_latency_ns = rng.next() % (100 * MS);
            s.write_latency_ns = rng.next() % (100 * MS);
            s
        })
        .collect();
    for len in 0..=9 {
        assert!(!detect(&history[..len], &params));
    }
}

#[test]
fn test_trend_increase_over_window() {
    let analyzer = Analyzer::new(&AnalyzerConfig::default());

    let mut old = snapshot("web-0", base_time());
    old.read_latency_ns = 10 * MS;
    old.write_latency_ns = 10 * MS;
    analyzer.apply_cycle(vec![old]);

    let now = base_time() + Duration::from_secs(300);
    let mut new = snapshot("web-0", now);
    new.read_latency_ns = 15 * MS;
    new.write_latency_ns = 10 * MS;
    analyzer.apply_cycle(vec![new]);

    let trend = analyzer
        .get_trend_at("web-0", Duration::from_secs(300), now)
        .expect("trend");
    assert_eq!(trend.direction, TrendDirection::Increased);
    assert!((trend.change_percent - 25.0).abs() < 1e-9);
}

#[test]
fn test_trend_needs_two_snapshots() {
    let analyzer = Analyzer::new(&AnalyzerConfig::default());
    analyzer.apply_cycle(vec![snapshot("web-0", base_time())]);

    let err = analyzer
        .get_trend("web-0", Duration::from_secs(300))
        .unwrap_err();
    assert_eq!(
        err,
        AnalysisError::InsufficientData {
            entity: "web-0".to_string(),
            have: 1,
            need: 2,
        }
    );
}

#[test]
fn test_top_n_orders_by_combined_latency() {
    let analyzer = Analyzer::new(&AnalyzerConfig::default());
    let cycle = [("a", 5 * MS), ("b", 30 * MS), ("c", 12 * MS)]
        .into_iter()
        .map(|(name, latency)| {
            let mut s = snapshot(name, base_time());
            s.read_latency_ns = latency;
            s
        })
        .collect();
    analyzer.apply_cycle(cycle);

    let top: Vec<u64> = analyzer
        .get_top_n(2)
        .iter()
        .map(EntitySnapshot::combined_latency_ns)
        .collect();
    assert_eq!(top, vec![30 * MS, 12 * MS]);
    assert_eq!(analyzer.get_top_n(10).len(), 3);
}

#[test]
fn test_completion_without_start_is_silent() {
    let mut correlator = Correlator::new(Duration::from_secs(30), 64);
    let end = ProbeEvent {
        timestamp_ns: 5_000,
        pid: 1,
        tid: 1,
        cgroup_id: 0,
        probe: ProbeKind::VfsReadExit,
        op: OpKind::Read,
        handle: 0,
        bytes: 0,
        entity: Some(EntityId::from("web-0")),
    };
    assert!(correlator.observe(&end).is_none());
    assert_eq!(correlator.stats().snapshot().unmatched, 1);
    assert_eq!(correlator.pending_len(), 0);
}

#[test]
fn test_decoder_rejects_truncated_and_unknown_samples() {
    let event = ProbeEvent {
        timestamp_ns: 1,
        pid: 1,
        tid: 1,
        cgroup_id: 42,
        probe: ProbeKind::BlockRqComplete,
        op: OpKind::Write,
        handle: 9,
        bytes: 512,
        entity: None,
    };
    let sample = encode_event(&event);

    assert!(matches!(
        parse_event(&sample[..10]),
        Err(ParseError::Truncated { size: 10 })
    ));

    let mut unknown = sample;
    unknown[16] = 0;
    assert!(matches!(
        parse_event(&unknown),
        Err(ParseError::UnknownProbe { raw: 0 })
    ));

    let parsed = parse_event(&sample).expect("valid sample");
    assert_eq!(parsed.cgroup_id, 42);
    assert_eq!(parsed.probe, ProbeKind::BlockRqComplete);
}
