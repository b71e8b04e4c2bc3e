//! Event source reading length-prefixed samples from a FIFO or file.
//!
//! The external probe loader writes each sample as a little-endian `u32`
//! length followed by the sample bytes. On EOF the pipe is reopened when
//! configured, so the loader may restart without restarting the agent.
//!
//! FIFOs are opened non-blocking, so a loader that has not connected yet
//! never holds a runtime thread.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;

use super::event::ProbeKind;
use super::parse::SAMPLE_SIZE;
use super::{handle_sample, report_error, ErrorHandler, EventHandler, ProbeFilter, Tracer};
use crate::config::TracerConfig;

/// Samples larger than this mean the stream lost framing.
const MAX_SAMPLE_LEN: usize = 4096;

/// Delay before reopening a closed or failed pipe.
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);

/// Pipe-backed tracer implementation.
pub struct PipeTracer {
    path: PathBuf,
    reopen_on_eof: bool,
    filter: ProbeFilter,
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl PipeTracer {
    pub fn new(cfg: &TracerConfig) -> Self {
        Self {
            path: PathBuf::from(&cfg.pipe_path),
            reopen_on_eof: cfg.reopen_on_eof,
            filter: ProbeFilter::all(),
            event_handlers: Vec::with_capacity(2),
            error_handlers: Vec::with_capacity(2),
            read_task: None,
        }
    }
}

impl Tracer for PipeTracer {
    fn name(&self) -> &str {
        "pipe"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("event source {}", self.path.display()))?;

        // Move handlers into the read task.
        let event_handlers = Arc::new(std::mem::take(&mut self.event_handlers));
        let error_handlers = Arc::new(std::mem::take(&mut self.error_handlers));
        let path = self.path.clone();
        let reopen = self.reopen_on_eof;
        let filter = self.filter;

        let handle = tokio::spawn(async move {
            read_loop(path, reopen, filter, event_handlers, error_handlers, ctx).await;
        });
        self.read_task = Some(handle);

        tracing::info!(path = %self.path.display(), "pipe tracer started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read task exits when the CancellationToken is cancelled.
        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for read task")?;
        }
        tracing::info!("pipe tracer stopped");
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

/// How a single open of the source ended.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Eof,
    Failed,
    Cancelled,
}

async fn read_loop(
    path: PathBuf,
    reopen: bool,
    filter: ProbeFilter,
    event_handlers: Arc<Vec<EventHandler>>,
    error_handlers: Arc<Vec<ErrorHandler>>,
    cancel: CancellationToken,
) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = open_source(&path) => result,
        };

        let end = match opened {
            Ok(source) => {
                tracing::debug!(path = %path.display(), "event source opened");
                read_stream(
                    BufReader::new(source),
                    &filter,
                    &event_handlers,
                    &error_handlers,
                    &cancel,
                )
                .await
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "opening event source failed");
                report_error(
                    &error_handlers,
                    anyhow::Error::new(e).context(format!("opening {}", path.display())),
                );
                StreamEnd::Failed
            }
        };

        if end == StreamEnd::Cancelled || !reopen {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REOPEN_BACKOFF) => {}
        }
    }
}

/// Opens the source for reading. A FIFO without a writer opens immediately
/// and its reads stay pending until the loader connects.
async fn open_source(path: &Path) -> std::io::Result<Box<dyn AsyncRead + Unpin + Send>> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.file_type().is_fifo() {
        let receiver = pipe::OpenOptions::new().open_receiver(path)?;
        return Ok(Box::new(receiver));
    }
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::new(file))
}

/// Read framed samples until EOF, a read error, or cancellation.
async fn read_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    filter: &ProbeFilter,
    event_handlers: &[EventHandler],
    error_handlers: &[ErrorHandler],
    cancel: &CancellationToken,
) -> StreamEnd {
    let mut len_buf = [0u8; 4];
    let mut sample = Vec::with_capacity(SAMPLE_SIZE);

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            r = reader.read_exact(&mut len_buf) => r,
        };
        if let Err(e) = read {
            return stream_error(e, error_handlers);
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_SAMPLE_LEN {
            tracing::warn!(len, "oversized sample, dropping stream");
            report_error(
                error_handlers,
                anyhow::anyhow!("sample length {len} exceeds {MAX_SAMPLE_LEN}"),
            );
            return StreamEnd::Failed;
        }

        sample.resize(len, 0);
        let read = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            r = reader.read_exact(&mut sample) => r,
        };
        if let Err(e) = read {
            return stream_error(e, error_handlers);
        }

        handle_sample(&sample, filter, event_handlers, error_handlers);
    }
}

fn stream_error(err: std::io::Error, error_handlers: &[ErrorHandler]) -> StreamEnd {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        return StreamEnd::Eof;
    }
    tracing::warn!(error = %err, "event source read error");
    report_error(error_handlers, anyhow::Error::new(err));
    StreamEnd::Failed
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::tracer::event::{OpKind, ProbeEvent};
    use crate::tracer::parse::encode_event;

    fn frame(event: &ProbeEvent) -> Vec<u8> {
        let sample = encode_event(event);
        let mut out = (sample.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(&sample);
        out
    }

    fn probe(ts: u64, kind: ProbeKind) -> ProbeEvent {
        ProbeEvent {
            timestamp_ns: ts,
            pid: 1,
            tid: 1,
            cgroup_id: 9,
            probe: kind,
            op: OpKind::Read,
            handle: 5,
            bytes: 0,
            entity: None,
        }
    }

    #[tokio::test]
    async fn test_reads_framed_samples_until_eof() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&frame(&probe(10, ProbeKind::RemoteIssue)))
            .expect("write");
        file.write_all(&frame(&probe(20, ProbeKind::RemoteComplete)))
            .expect("write");
        // Garbage sample: decodes as a parse error.
        file.write_all(&3u32.to_le_bytes()).expect("write");
        file.write_all(&[1, 2, 3]).expect("write");
        file.flush().expect("flush");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));

        let mut tracer = PipeTracer::new(&TracerConfig {
            pipe_path: file.path().display().to_string(),
            reopen_on_eof: false,
            ..Default::default()
        });
        let seen_cb = Arc::clone(&seen);
        tracer.on_event(Box::new(move |ev| seen_cb.lock().push(ev.timestamp_ns)));
        let errors_cb = Arc::clone(&errors);
        tracer.on_error(Box::new(move |_| {
            errors_cb.fetch_add(1, Ordering::Relaxed);
        }));

        tracer
            .start(CancellationToken::new())
            .await
            .expect("start should succeed");
        tracer.stop().await.expect("stop should succeed");

        assert_eq!(*seen.lock(), vec![10, 20]);
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_subscription_filters_probe_kinds() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&frame(&probe(10, ProbeKind::RemoteIssue)))
            .expect("write");
        file.write_all(&frame(&probe(20, ProbeKind::BlockRqIssue)))
            .expect("write");
        file.flush().expect("flush");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tracer = PipeTracer::new(&TracerConfig {
            pipe_path: file.path().display().to_string(),
            reopen_on_eof: false,
            ..Default::default()
        });
        tracer.subscribe(&[ProbeKind::BlockRqIssue]);
        let seen_cb = Arc::clone(&seen);
        tracer.on_event(Box::new(move |ev| seen_cb.lock().push(ev.probe)));

        tracer
            .start(CancellationToken::new())
            .await
            .expect("start should succeed");
        tracer.stop().await.expect("stop should succeed");

        assert_eq!(*seen.lock(), vec![ProbeKind::BlockRqIssue]);
    }

    #[tokio::test]
    async fn test_missing_source_fails_start() {
        let mut tracer = PipeTracer::new(&TracerConfig {
            pipe_path: "/nonexistent/ioeye/events".to_string(),
            ..Default::default()
        });
        let err = tracer
            .start(CancellationToken::new())
            .await
            .expect_err("start should fail");
        assert!(err.to_string().contains("event source"));
    }

    fn make_fifo(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("events");
        let status = std::process::Command::new("mkfifo")
            .arg(&path)
            .status()
            .expect("run mkfifo");
        assert!(status.success(), "mkfifo failed");
        path
    }

    #[test]
    fn test_unconnected_fifo_does_not_block_runtime_shutdown() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = make_fifo(&dir);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");

        rt.block_on(async {
            let mut tracer = PipeTracer::new(&TracerConfig {
                pipe_path: path.display().to_string(),
                reopen_on_eof: true,
                ..Default::default()
            });
            let cancel = CancellationToken::new();
            tracer.start(cancel.clone()).await.expect("start");

            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
            tracer.stop().await.expect("stop");
        });

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(rt);
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "runtime drop blocked on the FIFO open"
        );
    }

    #[tokio::test]
    async fn test_fifo_delivers_samples_once_writer_connects() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = make_fifo(&dir);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tracer = PipeTracer::new(&TracerConfig {
            pipe_path: path.display().to_string(),
            reopen_on_eof: false,
            ..Default::default()
        });
        let seen_cb = Arc::clone(&seen);
        tracer.on_event(Box::new(move |ev| seen_cb.lock().push(ev.timestamp_ns)));
        tracer
            .start(CancellationToken::new())
            .await
            .expect("start");

        // Give the reader time to open before the writer connects.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut sender = pipe::OpenOptions::new()
            .open_sender(&path)
            .expect("open writer");
        let mut bytes = frame(&probe(10, ProbeKind::RemoteIssue));
        bytes.extend(frame(&probe(20, ProbeKind::RemoteComplete)));
        tokio::io::AsyncWriteExt::write_all(&mut sender, &bytes)
            .await
            .expect("write");
        drop(sender);

        tokio::time::timeout(Duration::from_secs(5), tracer.stop())
            .await
            .expect("reader should see EOF")
            .expect("stop");
        assert_eq!(*seen.lock(), vec![10, 20]);
    }

    #[tokio::test]
    async fn test_oversized_length_fails_stream() {
        let data = (MAX_SAMPLE_LEN as u32 + 1).to_le_bytes().to_vec();
        let end = read_stream(
            data.as_slice(),
            &ProbeFilter::all(),
            &[],
            &[],
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(end, StreamEnd::Failed);
    }
}
