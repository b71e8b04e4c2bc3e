//! Collection and aggregation tasks.
//!
//! The collector task consumes probe events from a bounded channel,
//! correlates them into completed operations and records those into the
//! current [`WindowBuffer`]. The aggregation task wakes on a fixed interval,
//! lists the monitored entities, rotates the window, converts it into
//! snapshots and hands them to the [`Analyzer`].

pub mod aggregator;
pub mod buffer;
pub mod counters;
pub mod snapshot;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};
use prometheus::Counter;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::aggregator::{rate_seconds, Aggregator};
use self::buffer::{AtomicBuffer, WindowBuffer};
use crate::analyzer::trend::RankBy;
use crate::analyzer::{Analyzer, CycleView};
use crate::config::Config;
use crate::directory::{Directory, EntityIndex};
use crate::export::health::HealthMetrics;
use crate::tracer::correlate::{CorrelationStats, Correlator};
use crate::tracer::event::{EntityId, ProbeEvent, Stage};

/// Events drained from the channel per wakeup.
const BATCH_SIZE: usize = 256;

/// Longest wait for the collector to finish a batch on a rotated window.
const RELEASE_TIMEOUT: Duration = Duration::from_millis(50);

/// Cloneable handle that feeds probe events to the collector.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProbeEvent>,
    health: Option<Arc<HealthMetrics>>,
}

impl EventSink {
    /// Queues an event without blocking. Drops it when the channel is full.
    pub fn handle_event(&self, event: ProbeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if let Some(health) = &self.health {
                    health.events_dropped.inc();
                }
                warn!("collector event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("collector stopped, dropping event");
            }
        }
    }
}

/// Correlates probe events and records completions into the current window.
pub struct Collector {
    correlator: Correlator,
    index: Arc<EntityIndex>,
    buffer: Arc<AtomicBuffer>,
    completed_by_stage: Option<Vec<Counter>>,
    health: Option<Arc<HealthMetrics>>,
}

impl Collector {
    pub fn new(
        correlator: Correlator,
        index: Arc<EntityIndex>,
        buffer: Arc<AtomicBuffer>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let completed_by_stage = health.as_ref().map(|h| {
            Stage::all()
                .iter()
                .map(|stage| {
                    h.operations_completed
                        .with_label_values(&[stage.as_str()])
                })
                .collect()
        });

        Self {
            correlator,
            index,
            buffer,
            completed_by_stage,
            health,
        }
    }

    /// Resolves identity, correlates and records one event into `window`.
    #[inline]
    pub fn process(&mut self, window: &WindowBuffer, mut event: ProbeEvent) {
        if event.entity.is_none() && event.cgroup_id != 0 {
            event.entity = self.index.resolve(event.cgroup_id);
        }

        if let Some(op) = self.correlator.observe(&event) {
            if let Some(counter) = self
                .completed_by_stage
                .as_ref()
                .and_then(|counters| counters.get(op.stage as usize))
            {
                counter.inc();
            }
            window.record(&op);
        }
    }

    /// Drops orphaned starts and publishes the pending table size.
    pub fn sweep(&mut self) -> usize {
        let expired = self.correlator.sweep();
        if let Some(health) = &self.health {
            health
                .pending_starts
                .set(self.correlator.pending_len() as f64);
        }
        expired
    }

    pub fn correlation_stats(&self) -> Arc<CorrelationStats> {
        self.correlator.stats()
    }

    pub fn pending_len(&self) -> usize {
        self.correlator.pending_len()
    }

    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<ProbeEvent>,
        sweep_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut sweep_ticker = tokio::time::interval(sweep_interval);
        sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // In-flight correlation state is abandoned on shutdown.
                _ = cancel.cancelled() => return,

                received = event_rx.recv() => {
                    let Some(event) = received else {
                        debug!("event channel closed, collector exiting");
                        return;
                    };

                    let Some(window) = self.buffer.load() else {
                        continue;
                    };
                    self.process(&window, event);

                    // Drain up to BATCH_SIZE-1 more events without blocking.
                    for _ in 0..BATCH_SIZE - 1 {
                        match event_rx.try_recv() {
                            Ok(event) => self.process(&window, event),
                            Err(_) => break,
                        }
                    }
                }

                _ = sweep_ticker.tick() => {
                    let expired = self.sweep();
                    if expired > 0 {
                        debug!(expired, pending = self.pending_len(), "swept orphaned starts");
                    }
                }
            }
        }
    }
}

/// One timer-driven pass: list, rotate, aggregate, analyze.
pub struct CycleRunner {
    directory: Arc<dyn Directory>,
    scope: String,
    index: Arc<EntityIndex>,
    buffer: Arc<AtomicBuffer>,
    aggregator: Aggregator,
    analyzer: Arc<Analyzer>,
    correlation: Arc<CorrelationStats>,
    trend_window: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl CycleRunner {
    /// Runs one cycle. A directory failure returns an error before the window
    /// is rotated, so counters keep accumulating into the next attempt and
    /// history is left untouched.
    pub async fn run_cycle(&mut self) -> Result<Arc<CycleView>> {
        // 1. List monitored entities.
        let listing_started = Instant::now();
        let directory = Arc::clone(&self.directory);
        let scope = self.scope.clone();
        let listed = tokio::task::spawn_blocking(move || directory.list(&scope))
            .await
            .map_err(|e| anyhow!("directory task failed: {e}"))?
            .with_context(|| format!("listing entities from {}", self.directory.name()))?;
        if let Some(health) = &self.health {
            health
                .directory_refresh_duration
                .observe(listing_started.elapsed().as_secs_f64());
        }
        self.index.refresh(&listed);

        // 2. Rotate the window.
        let cycle_started = Instant::now();
        let now = SystemTime::now();
        let Some(window) = self.buffer.swap(WindowBuffer::new(cycle_started)) else {
            return Err(anyhow!("window buffer not initialized"));
        };
        let elapsed = cycle_started.saturating_duration_since(window.started);
        await_release(&window).await;

        // 3. Convert counters to snapshots.
        let totals = window.totals();
        let snapshots = self.aggregator.aggregate(&totals, &listed, elapsed, now);

        // 4. Retire entities that are neither listed nor active, then publish.
        let present: HashSet<EntityId> = snapshots
            .iter()
            .map(|snapshot| EntityId::clone(&snapshot.entity))
            .collect();
        let retired = self.analyzer.retain(|entity| present.contains(entity));
        if retired > 0 {
            debug!(retired, "retired departed entities");
        }
        let view = self.analyzer.apply_cycle(snapshots);

        self.record_metrics(&view, cycle_started);
        self.log_cycle(&view, elapsed);

        Ok(view)
    }

    fn record_metrics(&self, view: &CycleView, cycle_started: Instant) {
        let correlation = self.correlation.snapshot();
        let Some(health) = &self.health else {
            return;
        };

        health.cycles_total.inc();
        health
            .cycle_duration
            .observe(cycle_started.elapsed().as_secs_f64());

        health.completions_unmatched.inc_by(correlation.unmatched as f64);
        health.starts_expired.inc_by(correlation.expired as f64);
        health.starts_overflowed.inc_by(correlation.overflow as f64);
        health.starts_replaced.inc_by(correlation.replaced as f64);
        health
            .operations_unattributed
            .inc_by(correlation.unattributed as f64);
        health.operations_skewed.inc_by(correlation.skewed as f64);

        let summary = view.summary();
        health.entities_tracked.set(summary.entities as f64);
        health.anomalies_active.set(summary.anomalies as f64);
        for (kind, count) in summary.bottlenecks {
            health
                .entities_by_bottleneck
                .with_label_values(&[kind.as_str()])
                .set(count as f64);
        }
    }

    fn log_cycle(&self, view: &CycleView, elapsed: Duration) {
        let summary = view.summary();
        debug!(
            cycle = summary.cycle,
            entities = summary.entities,
            anomalies = summary.anomalies,
            carried = self.aggregator.tracked(),
            elapsed_secs = rate_seconds(elapsed),
            "aggregation cycle applied"
        );

        let Some(slowest) = self.analyzer.get_top_n_by(1, RankBy::Latency).pop() else {
            return;
        };

        match self.analyzer.get_trend(&slowest.entity, self.trend_window) {
            Ok(trend) => info!(
                entity = %slowest.entity,
                namespace = %slowest.namespace,
                latency_ns = slowest.combined_latency_ns(),
                bottleneck = %view.bottleneck(&slowest.entity),
                anomaly = view.anomaly(&slowest.entity),
                trend = %trend.direction,
                change_percent = trend.change_percent,
                "slowest entity"
            ),
            Err(e) => info!(
                entity = %slowest.entity,
                namespace = %slowest.namespace,
                latency_ns = slowest.combined_latency_ns(),
                bottleneck = %view.bottleneck(&slowest.entity),
                anomaly = view.anomaly(&slowest.entity),
                trend = %e,
                "slowest entity"
            ),
        }
    }
}

/// Waits for the collector to drop its handle on a rotated-out window.
///
/// The collector loads the window once per batch, so completions from that
/// batch can land after the swap. Anything recorded past the timeout is lost.
async fn await_release(window: &Arc<WindowBuffer>) {
    let deadline = Instant::now() + RELEASE_TIMEOUT;
    while Arc::strong_count(window) > 1 {
        if Instant::now() >= deadline {
            debug!("rotated window still held by collector");
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// Owns the collector and aggregation tasks.
pub struct StorageMonitor {
    interval: Duration,
    channel_capacity: usize,
    collector: Option<Collector>,
    runner: Option<CycleRunner>,
    buffer: Arc<AtomicBuffer>,
    health: Option<Arc<HealthMetrics>>,
    event_tx: mpsc::Sender<ProbeEvent>,
    event_rx: Option<mpsc::Receiver<ProbeEvent>>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StorageMonitor {
    pub fn new(
        cfg: &Config,
        analyzer: Arc<Analyzer>,
        directory: Arc<dyn Directory>,
        index: Arc<EntityIndex>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(cfg.monitor.event_channel_capacity);
        let buffer = Arc::new(AtomicBuffer::new());

        let correlator = Correlator::new(
            cfg.correlator.pending_horizon,
            cfg.correlator.max_pending,
        );
        let collector = Collector::new(
            correlator,
            Arc::clone(&index),
            Arc::clone(&buffer),
            health.clone(),
        );

        let runner = CycleRunner {
            directory,
            scope: cfg.directory.namespace.clone(),
            index,
            buffer: Arc::clone(&buffer),
            aggregator: Aggregator::new(
                cfg.monitor.idle_latency,
                &cfg.monitor.default_namespace,
            ),
            analyzer,
            correlation: collector.correlation_stats(),
            trend_window: cfg.analyzer.trend_window,
            health: health.clone(),
        };

        Self {
            interval: cfg.monitor.interval,
            channel_capacity: cfg.monitor.event_channel_capacity,
            collector: Some(collector),
            runner: Some(runner),
            buffer,
            health,
            event_tx,
            event_rx: Some(event_rx),
            tasks: tokio::sync::Mutex::new(Vec::with_capacity(2)),
        }
    }

    /// Handle for the tracer's event callback.
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            tx: self.event_tx.clone(),
            health: self.health.clone(),
        }
    }

    /// Seeds the entity index and spawns the collector and aggregation tasks.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let (Some(collector), Some(mut runner), Some(event_rx)) = (
            self.collector.take(),
            self.runner.take(),
            self.event_rx.take(),
        ) else {
            return Err(anyhow!("storage monitor already started"));
        };

        // Seed identity resolution before the first event arrives.
        let directory = Arc::clone(&runner.directory);
        let scope = runner.scope.clone();
        match tokio::task::spawn_blocking(move || directory.list(&scope)).await {
            Ok(Ok(listed)) => {
                runner.index.refresh(&listed);
                info!(
                    entities = listed.len(),
                    cgroups = runner.index.len(),
                    "seeded entity directory"
                );
            }
            Ok(Err(e)) => warn!(error = %e, "initial entity listing failed"),
            Err(e) => warn!(error = %e, "initial entity listing task failed"),
        }

        if let Some(health) = &self.health {
            health.event_channel_capacity.set(self.channel_capacity as f64);
        }

        self.buffer
            .store(WindowBuffer::new(Instant::now()));

        let interval = self.interval;
        let collector_task = tokio::spawn(collector.run(event_rx, interval, ctx.clone()));

        let health = self.health.clone();
        let aggregation_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = runner.run_cycle().await {
                            if let Some(health) = &health {
                                health.cycles_skipped.inc();
                            }
                            warn!(error = format!("{e:#}"), "aggregation cycle skipped");
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(collector_task);
        tasks.push(aggregation_task);

        info!(interval = ?interval, "storage monitor started");
        Ok(())
    }

    /// Waits for both tasks to exit. Cancel the token passed to `start` first.
    pub async fn wait_for_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "storage monitor task join failed");
            }
        }
        self.buffer.take();
    }
}
