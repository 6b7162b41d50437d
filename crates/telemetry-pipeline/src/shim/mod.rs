// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Out-of-process collectors, transforms and sinks.
//!
//! A shim child speaks newline-delimited line protocol: metrics go out on stdout,
//! metrics (or "gather now" prompts) come in on stdin, and logs go to stderr with the
//! `E!`/`W!`/`I!`/`D!` markers of [`crate::logger::ShimFormatter`]. An `E!` line is how a
//! child sink tells the host that a write failed.
//!
//! [`Shim`] is the child side. The host side lives in [`host`].

pub mod host;

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Stdin, Stdout};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::{Collector, GatherJob};
use crate::buffer::Buffer;
use crate::constants::{
    DEFAULT_BUFFER_LIMIT, DEFAULT_SHIM_BATCH_SIZE, DEFAULT_SHIM_BATCH_TIMEOUT,
    DEFAULT_SHUTDOWN_GRACE, DEFAULT_WRITE_TIMEOUT, MAX_LINE_LENGTH,
};
use crate::errors::{ShimError, SinkError};
use crate::flusher::{Flusher, FlusherConfig, FlusherStats, RetryStrategy, Sink};
use crate::line_protocol::{parse, serialize_into};
use crate::metric::Metric;
use crate::router::{Accumulator, Output, Route, Transform};
use crate::transforms::DropUnencodable;
use crate::scheduler::{schedule, ScheduleConfig, UnitState};

/// How a shimmed collector is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
    Every(Duration),
    /// Gather once per line received on stdin.
    Disabled,
}

/// Child side of the shim protocol.
pub struct Shim<R, W> {
    reader: R,
    writer: W,
    batch_size: usize,
    batch_timeout: Duration,
    cancel: CancellationToken,
    collector: Option<Arc<dyn Collector>>,
    transform: Option<Arc<dyn Transform>>,
    sink: Option<Arc<dyn Sink>>,
}

impl Shim<Stdin, Stdout> {
    /// Shim talking over the process' stdin and stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for Shim<Stdin, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> Shim<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn with_io(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            batch_size: DEFAULT_SHIM_BATCH_SIZE,
            batch_timeout: DEFAULT_SHIM_BATCH_TIMEOUT,
            cancel: CancellationToken::new(),
            collector: None,
            transform: None,
            sink: None,
        }
    }

    /// Metrics written to stdout at once. Writes also happen every `batch_timeout`.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    #[must_use]
    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cancelling this token shuts the shim down as if it had received SIGTERM.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs whichever role was configured, collector first.
    pub async fn run(mut self, poll: PollInterval) -> Result<(), ShimError> {
        if let Some(collector) = self.collector.take() {
            self.run_collector(collector, poll).await
        } else if let Some(transform) = self.transform.take() {
            self.run_transform(transform).await
        } else if let Some(sink) = self.sink.take() {
            self.run_sink(sink).await
        } else {
            Err(ShimError::NothingToRun)
        }
    }

    fn flusher_config(&self) -> FlusherConfig {
        FlusherConfig {
            batch_size: self.batch_size,
            flush_interval: self.batch_timeout,
            flush_jitter: Duration::ZERO,
            retry_strategy: RetryStrategy::Immediate(1),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Gathers from `collector` and writes what it produces to stdout.
    ///
    /// Returns when stdin reaches end-of-stream, on shutdown, or when the collector
    /// fails fatally. Failing to write to stdout is fatal.
    pub async fn run_collector(
        self,
        collector: Arc<dyn Collector>,
        poll: PollInterval,
    ) -> Result<(), ShimError> {
        let config = self.flusher_config();
        let Shim {
            reader,
            writer,
            cancel,
            ..
        } = self;
        let output = StdoutPipeline::start(writer, config);
        let route = Route::new("stdout")
            .with_transform(Arc::new(DropUnencodable))
            .with_output(Output::new(Arc::clone(&output.buffer)));
        let acc = Accumulator::for_route(collector.name(), Arc::new(route));

        if let Err(e) = collector.start(acc.clone()).await {
            output.finish().await?;
            return Err(e.into());
        }

        let interval = match poll {
            PollInterval::Every(interval) => Some(interval),
            PollInterval::Disabled => None,
        };
        let unit = schedule(
            collector.name(),
            Arc::new(GatherJob::new(Arc::clone(&collector), acc)),
            ScheduleConfig {
                interval,
                ..ScheduleConfig::default()
            },
            &cancel,
        );
        let mut state = unit.subscribe();
        let stopped = async move {
            while state.changed().await.is_ok() {
                if *state.borrow() == UnitState::Stopped {
                    break;
                }
            }
        };
        tokio::pin!(stopped);

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut read_error = None;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = output.failed() => break,
                () = &mut stopped => {
                    warn!("Collector stopped, shutting down");
                    break;
                }
                line = lines.next() => match line {
                    Some(Ok(_)) => {
                        if poll == PollInterval::Disabled {
                            unit.trigger();
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("Ignoring input line longer than {MAX_LINE_LENGTH} bytes");
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        read_error = Some(e);
                        break;
                    }
                    None => {
                        debug!("Input closed");
                        break;
                    }
                },
            }
        }

        let report = unit.stop().await;
        debug!(runs = report.stats.runs, "Collector unit stopped");
        collector.stop().await;
        output.finish().await?;
        read_error.map_or(Ok(()), |e| Err(ShimError::Read(e)))
    }

    /// Applies `transform` to every metric read from stdin and writes the results to
    /// stdout. Malformed lines are logged and skipped.
    pub async fn run_transform(self, transform: Arc<dyn Transform>) -> Result<(), ShimError> {
        let config = self.flusher_config();
        let Shim {
            reader,
            writer,
            cancel,
            ..
        } = self;
        let output = StdoutPipeline::start(writer, config);
        let route = Route::new("stdout")
            .with_transform(Arc::clone(&transform))
            .with_transform(Arc::new(DropUnencodable))
            .with_output(Output::new(Arc::clone(&output.buffer)));
        let acc = Accumulator::for_route(transform.name(), Arc::new(route));

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut read_error = None;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = output.failed() => break,
                line = lines.next() => match next_metric(line) {
                    Input::Metric(metric) => acc.add_metric(metric),
                    Input::Skip => {}
                    Input::Failed(e) => {
                        read_error = Some(e);
                        break;
                    }
                    Input::Closed => break,
                },
            }
        }

        output.finish().await?;
        read_error.map_or(Ok(()), |e| Err(ShimError::Read(e)))
    }

    /// Buffers metrics read from stdin and hands them to `sink` in batches.
    ///
    /// Write failures are logged at error level, which reaches the host as an `E!` line
    /// on stderr.
    pub async fn run_sink(self, sink: Arc<dyn Sink>) -> Result<(), ShimError> {
        let config = self.flusher_config();
        let Shim {
            reader,
            mut writer,
            cancel,
            batch_size,
            ..
        } = self;
        let buffer = Arc::new(
            Buffer::new(sink.name(), DEFAULT_BUFFER_LIMIT).with_flush_threshold(batch_size),
        );
        let flusher = Arc::new(Flusher::new(sink, Arc::clone(&buffer), config));
        let flush_cancel = CancellationToken::new();
        let span = info_span!("flusher", sink = flusher.sink_name());
        let task = tokio::spawn(Arc::clone(&flusher).run(flush_cancel.clone()).instrument(span));

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut read_error = None;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                line = lines.next() => match next_metric(line) {
                    Input::Metric(metric) => {
                        buffer.add(metric);
                    }
                    Input::Skip => {}
                    Input::Failed(e) => {
                        read_error = Some(e);
                        break;
                    }
                    Input::Closed => break,
                },
            }
        }

        flush_cancel.cancel();
        log_flusher_exit(flusher.sink_name(), task.await);
        writer.shutdown().await.map_err(ShimError::Write)?;
        read_error.map_or(Ok(()), |e| Err(ShimError::Read(e)))
    }
}

enum Input {
    Metric(Metric),
    Skip,
    Failed(io::Error),
    Closed,
}

fn next_metric(line: Option<Result<String, LinesCodecError>>) -> Input {
    match line {
        Some(Ok(line)) if line.trim().is_empty() => Input::Skip,
        Some(Ok(line)) => match parse(&line) {
            Ok(metric) => Input::Metric(metric),
            Err(e) => {
                warn!("Skipping malformed line: {e}");
                Input::Skip
            }
        },
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            warn!("Skipping line longer than {MAX_LINE_LENGTH} bytes");
            Input::Skip
        }
        Some(Err(LinesCodecError::Io(e))) => Input::Failed(e),
        None => {
            debug!("Input closed");
            Input::Closed
        }
    }
}

fn log_flusher_exit(sink: &str, result: Result<FlusherStats, tokio::task::JoinError>) {
    match result {
        Ok(stats) => debug!(
            sink,
            accepted = stats.accepted,
            rejected = stats.rejected,
            "Output flushed"
        ),
        Err(e) => error!(sink, "Flusher task failed: {e}"),
    }
}

/// Buffer, flusher and line writer behind a shim's stdout.
struct StdoutPipeline<W> {
    buffer: Arc<Buffer>,
    writer: Arc<LineProtocolWriter<W>>,
    cancel: CancellationToken,
    task: JoinHandle<FlusherStats>,
}

impl<W> StdoutPipeline<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn start(writer: W, config: FlusherConfig) -> Self {
        let buffer = Arc::new(
            Buffer::new("stdout", DEFAULT_BUFFER_LIMIT).with_flush_threshold(config.batch_size),
        );
        let writer = Arc::new(LineProtocolWriter::new(writer));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&writer) as Arc<dyn Sink>,
            Arc::clone(&buffer),
            config,
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            flusher
                .run(cancel.clone())
                .instrument(info_span!("flusher", sink = "stdout")),
        );
        Self {
            buffer,
            writer,
            cancel,
            task,
        }
    }

    fn failed(&self) -> WaitForCancellationFuture<'_> {
        self.writer.failed()
    }

    /// Final flush, then closes the writer. Surfaces the first write error, if any.
    async fn finish(self) -> Result<(), ShimError> {
        self.cancel.cancel();
        log_flusher_exit("stdout", self.task.await);
        match self.writer.take_error() {
            Some(e) => Err(ShimError::Write(e)),
            None => Ok(()),
        }
    }
}

/// Sink writing line protocol to an async writer, usually stdout.
///
/// The first write error is kept and poisons the writer: later writes fail as permanent
/// and [`LineProtocolWriter::failed`] resolves.
///
/// Metrics that cannot be serialized are skipped; route through
/// [`crate::transforms::DropUnencodable`] to drop them before they are buffered.
pub struct LineProtocolWriter<W> {
    writer: tokio::sync::Mutex<W>,
    error: Mutex<Option<io::Error>>,
    failed: CancellationToken,
}

impl<W> LineProtocolWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            error: Mutex::new(None),
            failed: CancellationToken::new(),
        }
    }

    /// Resolves once a write has failed.
    pub fn failed(&self) -> WaitForCancellationFuture<'_> {
        self.failed.cancelled()
    }

    pub fn take_error(&self) -> Option<io::Error> {
        #[allow(clippy::expect_used)]
        self.error.lock().expect("lock poisoned").take()
    }

    fn poison(&self, e: io::Error) -> SinkError {
        error!("Failed to write metrics: {e}");
        let reason = SinkError::Permanent(e.to_string());
        #[allow(clippy::expect_used)]
        self.error.lock().expect("lock poisoned").get_or_insert(e);
        self.failed.cancel();
        reason
    }
}

#[async_trait]
impl<W> Sink for LineProtocolWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&self, metrics: &[Metric]) -> Result<(), SinkError> {
        if self.failed.is_cancelled() {
            return Err(SinkError::Permanent("output already failed".to_string()));
        }
        let mut out = String::new();
        for metric in metrics {
            if let Err(e) = serialize_into(metric, &mut out) {
                error!("Skipping metric {}: {e}", metric.name);
            }
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(out.as_bytes()).await {
            return Err(self.poison(e));
        }
        if let Err(e) = writer.flush().await {
            return Err(self.poison(e));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| SinkError::Permanent(e.to_string()))
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM.
pub fn watch_for_shutdown(cancel: CancellationToken) -> Result<JoinHandle<()>, ShimError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).map_err(ShimError::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(ShimError::Signal)?;
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
                _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
            }
            cancel.cancel();
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
                return;
            }
            info!("Received ctrl-c, shutting down");
            cancel.cancel();
        }))
    }
}
