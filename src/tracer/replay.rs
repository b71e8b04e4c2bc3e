use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use super::event::{ProbeEvent, ProbeKind};
use super::parse::encode_event;
use super::{handle_sample, ErrorHandler, EventHandler, ProbeFilter, Tracer};

/// Samples delivered between scheduler yields.
const YIELD_EVERY: usize = 256;

/// Tracer that replays a fixed sequence of raw samples, then finishes.
///
/// Samples go through the same decoder as a live source, so malformed
/// input reaches the error handlers.
pub struct ReplayTracer {
    samples: Vec<Vec<u8>>,
    filter: ProbeFilter,
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl ReplayTracer {
    /// Replay raw wire samples.
    pub fn new(samples: Vec<Vec<u8>>) -> Self {
        Self {
            samples,
            filter: ProbeFilter::all(),
            event_handlers: Vec::with_capacity(2),
            error_handlers: Vec::with_capacity(2),
            read_task: None,
        }
    }

    /// Replay already-built events by encoding them first.
    pub fn from_events(events: &[ProbeEvent]) -> Self {
        Self::new(events.iter().map(|e| encode_event(e).to_vec()).collect())
    }
}

impl Tracer for ReplayTracer {
    fn name(&self) -> &str {
        "replay"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let samples = std::mem::take(&mut self.samples);
        let event_handlers = Arc::new(std::mem::take(&mut self.event_handlers));
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));
        let filter = self.filter;

        let handle = tokio::spawn(async move {
            for (i, sample) in samples.iter().enumerate() {
                if ctx.is_cancelled() {
                    return;
                }
                handle_sample(sample, &filter, &event_handlers, &error_handlers);
                if (i + 1) % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        self.read_task = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for replay task")?;
        }
        Ok(())
    }

    fn subscribe(&mut self, kinds: &[ProbeKind]) {
        self.filter = ProbeFilter::only(kinds);
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }
}
