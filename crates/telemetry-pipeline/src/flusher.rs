// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{Batch, Buffer};
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_SHUTDOWN_GRACE,
    DEFAULT_WRITE_TIMEOUT,
};
use crate::errors::{FlushError, SinkError};
use crate::metric::Metric;

/// Destination of buffered metrics.
///
/// A write may be retried with the same batch, so sinks must tolerate seeing a batch
/// more than once.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write(&self, metrics: &[Metric]) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Total attempts, no delay between them.
    Immediate(u64),
    /// Total attempts and the fixed delay in milliseconds between them.
    LinearBackoff(u64, u64),
    /// Delay doubles after every failed attempt, starting at `base_ms` and capped at `max_ms`.
    ExponentialBackoff {
        attempts: u64,
        base_ms: u64,
        max_ms: u64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryStrategy {
    /// Total number of write attempts per batch, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        match self {
            Self::Immediate(n) | Self::LinearBackoff(n, _) => (*n).max(1),
            Self::ExponentialBackoff { attempts, .. } => (*attempts).max(1),
        }
    }

    /// Pause after the `failed`-th failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, failed: u64) -> Duration {
        match self {
            Self::Immediate(_) => Duration::ZERO,
            Self::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
            Self::ExponentialBackoff {
                base_ms, max_ms, ..
            } => {
                let shift = u32::try_from(failed.saturating_sub(1)).unwrap_or(u32::MAX).min(63);
                let delay = base_ms.saturating_mul(1_u64 << shift);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlusherConfig {
    /// Most metrics handed to the sink in one write.
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Each interval flush is delayed by a random amount in `[0, flush_jitter)`.
    pub flush_jitter: Duration,
    pub retry_strategy: RetryStrategy,
    /// Bound for one write attempt. A timed-out attempt counts as failed.
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_jitter: Duration::ZERO,
            retry_strategy: RetryStrategy::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Outcome of a delivered batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sink: String,
    pub flushed: usize,
    pub attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlusherStats {
    pub sink: String,
    pub batches: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub retries: u64,
    pub timeouts: u64,
    /// Still buffered at shutdown and rejected.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct FlusherCounters {
    batches: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    abandoned: AtomicU64,
}

/// Moves metrics from one buffer to one sink.
///
/// Flushes are serialized: a sink never sees two batches from the same flusher at once,
/// and a retried batch is never overtaken by newer metrics.
pub struct Flusher {
    sink: Arc<dyn Sink>,
    buffer: Arc<Buffer>,
    config: FlusherConfig,
    in_flight: Mutex<()>,
    requested: Notify,
    counters: FlusherCounters,
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher")
            .field("sink", &self.sink.name())
            .field("buffer", &self.buffer.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Flusher {
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, buffer: Arc<Buffer>, config: FlusherConfig) -> Self {
        Self {
            sink,
            buffer,
            config,
            in_flight: Mutex::new(()),
            requested: Notify::new(),
            counters: FlusherCounters::default(),
        }
    }

    #[must_use]
    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Asks the running flusher to flush everything buffered as soon as possible.
    pub fn request_flush(&self) {
        self.requested.notify_one();
    }

    /// Delivers at most one batch. An empty buffer is a no-op.
    pub async fn flush(&self) -> Result<FlushReport, FlushError> {
        let _guard = self.in_flight.lock().await;
        self.flush_batch(&mut None, None).await
    }

    /// Flushes batches until the buffer is empty or a batch fails. Metrics added while
    /// this runs are left for the next flush. Returns the number of delivered metrics.
    pub async fn flush_all(&self) -> Result<usize, FlushError> {
        let _guard = self.in_flight.lock().await;
        self.flush_batches(&mut None, None).await
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.config.shutdown_grace
    }

    /// `deadline` is set the moment `cancel` fires and bounds everything after it.
    async fn flush_batches(
        &self,
        deadline: &mut Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, FlushError> {
        let batch_size = self.config.batch_size.max(1);
        let batches = self.buffer.len().div_ceil(batch_size);
        let mut flushed = 0;
        for _ in 0..batches {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let report = self.flush_batch(deadline, cancel).await?;
            if report.flushed == 0 {
                break;
            }
            flushed += report.flushed;
        }
        Ok(flushed)
    }

    async fn flush_batch(
        &self,
        deadline: &mut Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushReport, FlushError> {
        let batch = self.buffer.drain(self.config.batch_size.max(1));
        if batch.is_empty() {
            return Ok(FlushReport {
                sink: self.sink.name().to_string(),
                flushed: 0,
                attempts: 0,
            });
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.deliver(batch, deadline, cancel).await
    }

    /// Awaits `fut` unless shutdown runs out of time first, in which case `None`.
    ///
    /// Without a deadline, cancellation starts the grace period; from then on `fut` only
    /// gets until the deadline.
    async fn until_shutdown<F: Future>(
        &self,
        fut: F,
        deadline: &mut Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Option<F::Output> {
        tokio::pin!(fut);
        if let (None, Some(cancel)) = (*deadline, cancel) {
            tokio::select! {
                biased;
                out = &mut fut => return Some(out),
                () = cancel.cancelled() => {
                    *deadline = Some(Instant::now() + self.config.shutdown_grace);
                }
            }
        }
        match *deadline {
            Some(d) => timeout_at(d, fut).await.ok(),
            None => Some(fut.await),
        }
    }

    /// Writes one batch with retries. Every path settles the whole batch, and with a
    /// deadline no attempt or backoff extends past it.
    async fn deliver(
        &self,
        batch: Batch,
        deadline: &mut Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushReport, FlushError> {
        let sink = self.sink.name().to_string();
        let count = batch.len();
        let max_attempts = self.config.retry_strategy.attempts();
        debug!(sink = %sink, "Flushing {count} metrics");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let write_timeout = match *deadline {
                Some(d) => self
                    .config
                    .write_timeout
                    .min(d.saturating_duration_since(Instant::now())),
                None => self.config.write_timeout,
            };
            let write = timeout(write_timeout, self.sink.write(batch.as_slice()));
            let outcome = self.until_shutdown(write, deadline, cancel).await;
            let result = match outcome {
                Some(Ok(result)) => result,
                Some(Err(_)) => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(SinkError::Timeout(write_timeout))
                }
                None => {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(sink = %sink, "Write still running when the shutdown grace period ended");
                    let reason = SinkError::Timeout(self.config.shutdown_grace);
                    return Err(self.reject(batch, sink, attempt, reason));
                }
            };

            let reason = match result {
                Ok(()) => {
                    debug!(sink = %sink, "Successfully flushed {count} metrics");
                    self.counters
                        .accepted
                        .fetch_add(count as u64, Ordering::Relaxed);
                    batch.accept_all();
                    return Ok(FlushReport {
                        sink,
                        flushed: count,
                        attempts: attempt,
                    });
                }
                Err(reason) => reason,
            };

            let delay = self.config.retry_strategy.delay_after(attempt);
            let out_of_time = deadline.is_some_and(|d| Instant::now() + delay >= d);
            if reason.is_permanent() || attempt >= max_attempts || out_of_time {
                if out_of_time && attempt < max_attempts {
                    warn!(sink = %sink, "No time left to retry before shutdown");
                }
                return Err(self.reject(batch, sink, attempt, reason));
            }

            warn!(
                sink = %sink,
                "Flush attempt {attempt}/{max_attempts} failed: {reason}. Retrying in {delay:?}"
            );
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            if !delay.is_zero()
                && self
                    .until_shutdown(sleep(delay), deadline, cancel)
                    .await
                    .is_none()
            {
                warn!(sink = %sink, "No time left to retry before shutdown");
                return Err(self.reject(batch, sink, attempt, reason));
            }
        }
    }

    fn reject(&self, batch: Batch, sink: String, attempts: u64, reason: SinkError) -> FlushError {
        let count = batch.len();
        error!(
            sink = %sink,
            "Failed to flush {count} metrics after {attempts} attempt(s), data dropped: {reason}"
        );
        self.counters
            .rejected
            .fetch_add(count as u64, Ordering::Relaxed);
        batch.reject_all();
        FlushError::Rejected {
            sink,
            count,
            attempts,
            reason,
        }
    }

    #[must_use]
    pub fn stats(&self) -> FlusherStats {
        FlusherStats {
            sink: self.sink.name().to_string(),
            batches: self.counters.batches.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Flushes on the interval, when the buffer reports a full batch, and on request.
    ///
    /// Cancellation starts the grace period, including for a batch that is being written
    /// or waiting to be retried at that moment. Everything still buffered gets one last
    /// chance within it; whatever remains afterwards is rejected and the sink is closed,
    /// which may take up to another grace period.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> FlusherStats {
        let sink = self.sink.name().to_string();
        if let Err(e) = self.sink.connect().await {
            error!(sink = %sink, "Failed to connect sink: {e}");
        }

        let interval = self.config.flush_interval;
        let batch_size = self.config.batch_size.max(1);
        let mut base = Instant::now() + interval;
        let mut next = base + self.roll_jitter();
        // Set once cancellation is seen, by an in-flight flush or below.
        let mut deadline = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = sleep_until(next) => {
                    base += interval;
                    next = base.max(Instant::now()) + self.roll_jitter();
                    let _guard = self.in_flight.lock().await;
                    self.log_failure(self.flush_batches(&mut deadline, Some(&cancel)).await.map(|_| ()));
                }
                () = self.buffer.batch_ready() => {
                    let _guard = self.in_flight.lock().await;
                    // Keep going while full batches are waiting; one wakeup may cover many.
                    loop {
                        match self.flush_batch(&mut deadline, Some(&cancel)).await {
                            Ok(report)
                                if report.flushed > 0
                                    && self.buffer.len() >= batch_size
                                    && !cancel.is_cancelled() => {}
                            result => {
                                self.log_failure(result.map(|_| ()));
                                break;
                            }
                        }
                    }
                }
                () = self.requested.notified() => {
                    let _guard = self.in_flight.lock().await;
                    self.log_failure(self.flush_batches(&mut deadline, Some(&cancel)).await.map(|_| ()));
                }
            }
        }

        debug!(sink = %sink, "Final flush");
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.config.shutdown_grace);
        match timeout_at(deadline, self.in_flight.lock()).await {
            Ok(_guard) => self.log_failure(
                self.flush_batches(&mut Some(deadline), None)
                    .await
                    .map(|_| ()),
            ),
            Err(_) => warn!(
                sink = %sink,
                "Flush still in flight after {:?}, skipping final flush",
                self.config.shutdown_grace
            ),
        }
        let abandoned = self.buffer.reject_all();
        self.counters
            .abandoned
            .fetch_add(abandoned as u64, Ordering::Relaxed);

        match timeout(self.config.shutdown_grace, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(sink = %sink, "Failed to close sink: {e}"),
            Err(_) => warn!(sink = %sink, "Sink still closing after {:?}", self.config.shutdown_grace),
        }
        info!(sink = %sink, "Flusher stopped");
        self.stats()
    }

    fn roll_jitter(&self) -> Duration {
        let jitter = u64::try_from(self.config.flush_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..jitter))
    }

    fn log_failure(&self, result: Result<(), FlushError>) {
        // The batch has already been rejected and logged; nothing else to do here.
        if let Err(e) = result {
            debug!("{e}");
        }
    }
}
