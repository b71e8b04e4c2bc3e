use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::Counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::directory::{CompositeDirectory, Directory, EntityIndex};
use crate::export::health::HealthMetrics;
use crate::monitor::StorageMonitor;
use crate::tracer::event::{ProbeKind, MAX_PROBE_KIND};
use crate::tracer::parse::ParseError;
use crate::tracer::pipe::PipeTracer;
use crate::tracer::stats::EventStats;
use crate::tracer::Tracer;

/// Agent wires the event source, storage monitor, analyzer and health server.
pub struct Agent<T: Tracer = PipeTracer> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    analyzer: Arc<Analyzer>,
    index: Arc<EntityIndex>,
    monitor: Option<StorageMonitor>,
    tracer: Option<T>,
    captured_stats: Arc<EventStats>,
    cancel: CancellationToken,
}

fn build_probe_counters(health: &HealthMetrics) -> Vec<Option<Counter>> {
    let mut counters = vec![None; MAX_PROBE_KIND + 1];
    for kind in ProbeKind::all() {
        if let Some(slot) = counters.get_mut(*kind as usize) {
            *slot = Some(health.events_by_probe.with_label_values(&[kind.as_str()]));
        }
    }
    counters
}

impl Agent<PipeTracer> {
    /// Creates an agent reading probe events from the configured pipe.
    pub fn new(cfg: Config) -> Result<Self> {
        let tracer = PipeTracer::new(&cfg.tracer);
        Self::with_tracer(cfg, tracer)
    }
}

impl<T: Tracer> Agent<T> {
    /// Creates an agent around an existing event source.
    pub fn with_tracer(cfg: Config, tracer: T) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let analyzer = Arc::new(Analyzer::new(&cfg.analyzer));

        Ok(Self {
            cfg,
            health,
            analyzer,
            index: Arc::new(EntityIndex::new()),
            monitor: None,
            tracer: Some(tracer),
            captured_stats: Arc::new(EventStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Query surface over the published analysis results.
    pub fn analyzer(&self) -> Arc<Analyzer> {
        Arc::clone(&self.analyzer)
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Start all components and begin observation.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        // 1. Build the entity directory.
        let directory: Arc<dyn Directory> = Arc::new(CompositeDirectory::from_config(
            &self.cfg.directory,
            &self.cfg.monitor.default_namespace,
        ));
        info!(
            static_entities = self.cfg.directory.entities.len(),
            cgroup_root = %self.cfg.directory.cgroup_root,
            scope = %self.cfg.directory.namespace,
            "entity directory configured",
        );

        // 2. Start the storage monitor. This seeds the entity index.
        let mut monitor = StorageMonitor::new(
            &self.cfg,
            Arc::clone(&self.analyzer),
            directory,
            Arc::clone(&self.index),
            Some(Arc::clone(&self.health)),
        );
        monitor
            .start(self.cancel.child_token())
            .await
            .context("starting storage monitor")?;
        let sink = monitor.event_sink();
        self.monitor = Some(monitor);

        // 3. Register tracer handlers.
        let tracer = self
            .tracer
            .as_mut()
            .context("tracer already consumed")?;

        let health_ev = Arc::clone(&self.health);
        let captured_stats = Arc::clone(&self.captured_stats);
        let probe_counters = build_probe_counters(&health_ev);
        tracer.on_event(Box::new(move |event| {
            health_ev.events_received.inc();
            captured_stats.record(&event);

            if let Some(counter) = probe_counters
                .get(event.probe as usize)
                .and_then(Option::as_ref)
            {
                counter.inc();
            }

            sink.handle_event(event);
        }));

        let health_err = Arc::clone(&self.health);
        tracer.on_error(Box::new(move |err| {
            match err.downcast_ref::<ParseError>() {
                Some(parse_err) => {
                    health_err
                        .event_parse_errors
                        .with_label_values(&[parse_err.kind()])
                        .inc();
                    debug!(error = %parse_err, "dropping malformed event");
                }
                None => {
                    health_err.source_errors.inc();
                    warn!(error = format!("{err:#}"), "event source error");
                }
            }
        }));

        // 4. Start the tracer.
        tracer.subscribe(&self.cfg.tracer.probe_kinds());
        let tracer_name = tracer.name().to_string();
        tracer
            .start(self.cancel.child_token())
            .await
            .with_context(|| format!("starting {tracer_name} tracer"))?;
        info!(tracer = %tracer_name, "tracer started");

        // 5. Start background reporters.
        self.spawn_event_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Stop tracer so no more events are queued.
        if let Some(tracer) = &mut self.tracer {
            if let Err(e) = tracer.stop().await {
                error!(error = %e, "error stopping tracer");
            }
        }

        // Wait for collector and aggregation tasks.
        if let Some(monitor) = &self.monitor {
            monitor.wait_for_shutdown().await;
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let captured_stats = Arc::clone(&self.captured_stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let counts = captured_stats.drain();
                        let total: u64 = counts.iter().map(|c| c.events).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(captured = total, "event stats (60s)");

                        for count in &counts {
                            debug!(
                                probe = %count.probe,
                                events = count.events,
                                bytes = count.bytes,
                                "  by probe (60s)",
                            );
                        }
                    }
                }
            }
        });
    }
}
