pub mod correlate;
pub mod event;
pub mod parse;
pub mod pipe;
pub mod replay;
pub mod stats;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::event::{ProbeEvent, ProbeKind, MAX_PROBE_KIND};

/// Callback for decoded probe events.
pub type EventHandler = Box<dyn Fn(ProbeEvent) + Send + Sync>;

/// Callback for tracer errors.
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) + Send + Sync>;

/// Tracer delivers kernel I/O probe events from an external source.
pub trait Tracer: Send {
    /// Returns the tracer's name for logging.
    fn name(&self) -> &str;

    /// Begin reading events. Handlers must be registered before this call.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for the reader to finish. Cancel the token passed to `start` first.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Restrict delivery to the given probe kinds. An empty slice means all.
    fn subscribe(&mut self, kinds: &[ProbeKind]);

    /// Register a handler for decoded events.
    fn on_event(&mut self, handler: EventHandler);

    /// Register a handler for tracer errors.
    fn on_error(&mut self, handler: ErrorHandler);
}

/// Set of probe kinds a tracer forwards.
#[derive(Debug, Clone, Copy)]
pub struct ProbeFilter {
    enabled: [bool; MAX_PROBE_KIND + 1],
}

impl ProbeFilter {
    /// Filter passing every probe kind.
    pub fn all() -> Self {
        Self {
            enabled: [true; MAX_PROBE_KIND + 1],
        }
    }

    /// Filter passing only `kinds`, or everything when `kinds` is empty.
    pub fn only(kinds: &[ProbeKind]) -> Self {
        if kinds.is_empty() {
            return Self::all();
        }
        let mut enabled = [false; MAX_PROBE_KIND + 1];
        for kind in kinds {
            if let Some(slot) = enabled.get_mut(*kind as usize) {
                *slot = true;
            }
        }
        Self { enabled }
    }

    pub fn contains(&self, kind: ProbeKind) -> bool {
        self.enabled.get(kind as usize).copied().unwrap_or(false)
    }
}

impl Default for ProbeFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Deliver one event to every handler, cloning only when there is more than one.
fn dispatch(handlers: &[EventHandler], event: ProbeEvent) {
    match handlers.len() {
        0 => {}
        1 => {
            if let Some(handler) = handlers.first() {
                handler(event);
            }
        }
        len => {
            for handler in handlers.iter().take(len - 1) {
                handler(event.clone());
            }
            if let Some(last_handler) = handlers.get(len - 1) {
                last_handler(event);
            }
        }
    }
}

fn report_error(handlers: &[ErrorHandler], err: anyhow::Error) {
    match handlers.split_last() {
        None => {}
        Some((last, rest)) => {
            for handler in rest {
                handler(anyhow::anyhow!("{err:#}"));
            }
            last(err);
        }
    }
}

/// Decode one sample and route it to the handlers.
fn handle_sample(
    data: &[u8],
    filter: &ProbeFilter,
    event_handlers: &[EventHandler],
    error_handlers: &[ErrorHandler],
) {
    match parse::parse_event(data) {
        Ok(event) => {
            if filter.contains(event.probe) {
                dispatch(event_handlers, event);
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "event parse error");
            report_error(error_handlers, anyhow::Error::new(e));
        }
    }
}
