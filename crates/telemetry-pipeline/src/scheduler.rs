// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic, non re-entrant scheduling of pipeline units.
//!
//! Every unit runs in its own task. A fire is produced by the unit's timer or by an
//! external [`UnitHandle::trigger`]; while a run is in flight, further fires are skipped
//! or queued (at most one) according to [`OverrunPolicy`].

use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::constants::{DEFAULT_COLLECTION_INTERVAL, DEFAULT_SHUTDOWN_GRACE};
use crate::errors::CollectError;

/// Work executed on every fire.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Runs once. [`CollectError::Fatal`] stops the unit for good.
    async fn run(&self) -> Result<(), CollectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Drop fires that happen while a run is in flight.
    #[default]
    Skip,
    /// Keep at most one pending fire and start it as soon as the current run ends.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// `None` disables the timer; the unit then only runs when triggered.
    pub interval: Option<Duration>,
    /// Each fire is delayed by a fresh random amount in `[0, jitter)`.
    pub jitter: Duration,
    /// Fire on wall-clock multiples of the interval.
    pub align: bool,
    pub overrun: OverrunPolicy,
    pub run_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Some(DEFAULT_COLLECTION_INTERVAL),
            jitter: Duration::ZERO,
            align: false,
            overrun: OverrunPolicy::Skip,
            run_timeout: DEFAULT_COLLECTION_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    /// Next timer fire.
    Waiting(Instant),
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct UnitCounters {
    runs: AtomicU64,
    skipped: AtomicU64,
    queued: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    healthy: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub runs: u64,
    pub skipped: u64,
    pub queued: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub healthy: bool,
}

impl UnitCounters {
    fn snapshot(&self) -> UnitStats {
        UnitStats {
            runs: self.runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Relaxed),
        }
    }
}

/// Final account of a unit, returned once its task has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub name: String,
    #[serde(flatten)]
    pub stats: UnitStats,
    /// A run was still in flight when the grace period ran out and was aborted.
    pub incomplete: bool,
}

#[derive(Debug)]
enum RunOutcome {
    Completed,
    Failed(String),
    Fatal(String),
    TimedOut,
}

/// Control surface of a scheduled unit.
#[derive(Debug)]
pub struct UnitHandle {
    name: String,
    trigger: Arc<Notify>,
    state: watch::Receiver<UnitState>,
    counters: Arc<UnitCounters>,
    cancel: CancellationToken,
    task: JoinHandle<UnitReport>,
}

impl UnitHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests an immediate run, subject to the overrun policy.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    #[must_use]
    pub fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UnitState> {
        self.state.clone()
    }

    #[must_use]
    pub fn stats(&self) -> UnitStats {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.counters.healthy.load(Ordering::Relaxed)
    }

    /// Stops scheduling without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the unit task to end.
    pub async fn join(self) -> UnitReport {
        let Self {
            name,
            counters,
            task,
            ..
        } = self;
        match task.await {
            Ok(report) => report,
            Err(e) => {
                error!(unit = %name, "Scheduler task ended abnormally: {e}");
                counters.healthy.store(false, Ordering::Relaxed);
                UnitReport {
                    name,
                    stats: counters.snapshot(),
                    incomplete: true,
                }
            }
        }
    }

    /// Cancels the unit and waits for it to wind down within its grace period.
    pub async fn stop(self) -> UnitReport {
        self.cancel();
        self.join().await
    }
}

/// Starts scheduling `job` in its own task. Cancelling `parent` stops the unit.
pub fn schedule(
    name: impl Into<String>,
    job: Arc<dyn Job>,
    config: ScheduleConfig,
    parent: &CancellationToken,
) -> UnitHandle {
    let name = name.into();
    let trigger = Arc::new(Notify::new());
    let (state_tx, state_rx) = watch::channel(UnitState::Idle);
    let counters = Arc::new(UnitCounters {
        healthy: AtomicBool::new(true),
        ..UnitCounters::default()
    });
    let cancel = parent.child_token();

    let unit = Unit {
        name: name.clone(),
        job,
        config,
        trigger: Arc::clone(&trigger),
        state: state_tx,
        counters: Arc::clone(&counters),
        cancel: cancel.clone(),
    };
    let span = info_span!("unit", name = %name);
    let task = tokio::spawn(unit.run().instrument(span));

    UnitHandle {
        name,
        trigger,
        state: state_rx,
        counters,
        cancel,
        task,
    }
}

struct Unit {
    name: String,
    job: Arc<dyn Job>,
    config: ScheduleConfig,
    trigger: Arc<Notify>,
    state: watch::Sender<UnitState>,
    counters: Arc<UnitCounters>,
    cancel: CancellationToken,
}

impl Unit {
    async fn run(self) -> UnitReport {
        let mut base = self.first_base();
        let mut next_fire = base.map(|b| b + self.roll_jitter());
        let mut in_flight: Option<JoinHandle<RunOutcome>> = None;
        let mut queued = false;

        debug!(interval = ?self.config.interval, "Unit scheduled");

        loop {
            self.publish(if in_flight.is_some() {
                UnitState::Running
            } else {
                next_fire.map_or(UnitState::Idle, UnitState::Waiting)
            });

            let fired = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = wait_run(&mut in_flight) => {
                    in_flight = None;
                    if !self.record(result) {
                        break;
                    }
                    if queued {
                        queued = false;
                        debug!("Starting queued run");
                        in_flight = Some(self.start_run());
                    }
                    false
                }
                () = sleep_opt(next_fire) => {
                    if let (Some(b), Some(interval)) = (base, self.config.interval) {
                        let advanced = advance(b, interval, Instant::now());
                        base = Some(advanced);
                        next_fire = Some(advanced + self.roll_jitter());
                    }
                    true
                }
                () = self.trigger.notified() => {
                    debug!("Unit triggered");
                    true
                }
            };

            if !fired {
                continue;
            }
            if in_flight.is_none() {
                in_flight = Some(self.start_run());
                continue;
            }
            match self.config.overrun {
                OverrunPolicy::Queue if !queued => {
                    queued = true;
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    debug!("Previous run still in flight, queueing fire");
                }
                _ => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    warn!("Previous run still in flight, skipping fire");
                }
            }
        }

        let incomplete = match in_flight {
            Some(run) => self.wind_down(run).await,
            None => false,
        };
        self.publish(UnitState::Stopped);
        info!("Unit stopped");

        UnitReport {
            name: self.name,
            stats: self.counters.snapshot(),
            incomplete,
        }
    }

    fn first_base(&self) -> Option<Instant> {
        let interval = self.config.interval?;
        let now = Instant::now();
        if self.config.align {
            let since_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Some(now + align_delay(since_epoch, interval))
        } else {
            Some(now + interval)
        }
    }

    fn roll_jitter(&self) -> Duration {
        let jitter = u64::try_from(self.config.jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..jitter))
    }

    fn publish(&self, state: UnitState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn start_run(&self) -> JoinHandle<RunOutcome> {
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        self.publish(UnitState::Running);
        let job = Arc::clone(&self.job);
        let run_timeout = self.config.run_timeout;
        tokio::spawn(
            async move {
                match timeout(run_timeout, job.run()).await {
                    Ok(Ok(())) => RunOutcome::Completed,
                    Ok(Err(CollectError::Failed(e))) => RunOutcome::Failed(e),
                    Ok(Err(CollectError::Fatal(e))) => RunOutcome::Fatal(e),
                    Err(_) => RunOutcome::TimedOut,
                }
            }
            .in_current_span(),
        )
    }

    /// Accounts for a finished run. Returns false when the unit must stop.
    fn record(&self, result: Result<RunOutcome, JoinError>) -> bool {
        match result {
            Ok(RunOutcome::Completed) => true,
            Ok(RunOutcome::Failed(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Run failed: {e}");
                true
            }
            Ok(RunOutcome::TimedOut) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Run did not complete within {:?}, abandoning it",
                    self.config.run_timeout
                );
                true
            }
            Ok(RunOutcome::Fatal(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.healthy.store(false, Ordering::Relaxed);
                error!("Unit is unhealthy and will not be scheduled again: {e}");
                false
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Run panicked: {e}");
                true
            }
        }
    }

    /// Gives the in-flight run its grace period. Returns true if it had to be aborted.
    async fn wind_down(&self, mut run: JoinHandle<RunOutcome>) -> bool {
        debug!(
            "Waiting up to {:?} for in-flight run",
            self.config.shutdown_grace
        );
        match timeout(self.config.shutdown_grace, &mut run).await {
            Ok(result) => {
                self.record(result);
                false
            }
            Err(_) => {
                run.abort();
                warn!("In-flight run exceeded the shutdown grace period and was aborted");
                true
            }
        }
    }
}

async fn wait_run(run: &mut Option<JoinHandle<RunOutcome>>) -> Result<RunOutcome, JoinError> {
    match run {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Next base after `base`, skipping boundaries that already passed so the schedule never
/// bursts to catch up.
fn advance(base: Instant, interval: Duration, now: Instant) -> Instant {
    let mut next = base + interval;
    if next <= now && !interval.is_zero() {
        let behind = now.duration_since(next).as_nanos() / interval.as_nanos();
        let missed = u32::try_from(behind + 1).unwrap_or(u32::MAX);
        debug!("Schedule fell {missed} interval(s) behind, skipping ahead");
        next += interval.saturating_mul(missed);
    }
    next
}

/// Delay until the next wall-clock multiple of `interval`.
fn align_delay(since_epoch: Duration, interval: Duration) -> Duration {
    let step = interval.as_nanos();
    if step == 0 {
        return Duration::ZERO;
    }
    let rem = since_epoch.as_nanos() % step;
    let wait = if rem == 0 { step } else { step - rem };
    Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    struct Recorder {
        fires: Mutex<Vec<Instant>>,
        running: AtomicBool,
        overlapped: AtomicBool,
        work: Duration,
        result: fn() -> Result<(), CollectError>,
    }

    impl Recorder {
        fn new(work: Duration) -> Arc<Self> {
            Self::with_result(work, || Ok(()))
        }

        fn with_result(work: Duration, result: fn() -> Result<(), CollectError>) -> Arc<Self> {
            Arc::new(Self {
                fires: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                work,
                result,
            })
        }

        fn fires(&self) -> Vec<Instant> {
            self.fires.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl Job for Recorder {
        async fn run(&self) -> Result<(), CollectError> {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.fires.lock().expect("lock poisoned").push(Instant::now());
            sleep(self.work).await;
            self.running.store(false, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn every(interval: Duration) -> ScheduleConfig {
        ScheduleConfig {
            interval: Some(interval),
            run_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(1),
            ..ScheduleConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_every_interval_without_overlap() {
        let job = Recorder::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let handle = schedule("cpu", job.clone(), every(Duration::from_millis(100)), &cancel);

        sleep(Duration::from_millis(1_050)).await;
        let report = handle.stop().await;

        let fires = job.fires();
        assert_eq!(fires.len(), 10);
        assert_eq!(report.stats.runs, 10);
        assert!(!report.incomplete);
        let mut previous = start;
        for fire in fires {
            let step = fire.duration_since(previous);
            assert!(step >= Duration::from_millis(100) && step < Duration::from_millis(110));
            previous = fire;
        }
        assert!(!job.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_does_not_drift_schedule() {
        let job = Recorder::new(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let config = ScheduleConfig {
            jitter: Duration::from_millis(50),
            ..every(Duration::from_millis(100))
        };
        let handle = schedule("jittered", job.clone(), config, &cancel);

        sleep(Duration::from_millis(1_001)).await;
        handle.stop().await;

        let fires = job.fires();
        assert!(fires.len() >= 9);
        for (k, fire) in fires.iter().enumerate() {
            let offset = fire.duration_since(start);
            let slot = Duration::from_millis(100 * (k as u64 + 1));
            assert!(offset >= slot && offset < slot + Duration::from_millis(50));
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_overrun_is_skipped() {
        let job = Recorder::new(Duration::from_millis(250));
        let cancel = CancellationToken::new();
        let handle = schedule("slow", job.clone(), every(Duration::from_millis(100)), &cancel);

        sleep(Duration::from_millis(1_000)).await;
        let report = handle.stop().await;

        assert!(report.stats.skipped > 0);
        assert!(!job.overlapped.load(Ordering::SeqCst));
        assert!(logs_contain("skipping fire"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_queues_at_most_one() {
        let job = Recorder::new(Duration::from_millis(250));
        let cancel = CancellationToken::new();
        let config = ScheduleConfig {
            overrun: OverrunPolicy::Queue,
            ..every(Duration::from_millis(100))
        };
        let handle = schedule("queued", job.clone(), config, &cancel);

        // Runs start at 100 and, queued, at 350.
        sleep(Duration::from_millis(360)).await;
        let stats = handle.stats();
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.skipped, 1);
        handle.stop().await;
        assert!(!job.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_interval_only_runs_on_trigger() {
        let job = Recorder::new(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let config = ScheduleConfig {
            interval: None,
            ..ScheduleConfig::default()
        };
        let handle = schedule("manual", job.clone(), config, &cancel);
        assert_eq!(handle.state(), UnitState::Idle);

        sleep(Duration::from_secs(60)).await;
        assert!(job.fires().is_empty());

        handle.trigger();
        sleep(Duration::from_millis(10)).await;
        handle.trigger();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(handle.stop().await.stats.runs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_abandons_run() {
        let job = Recorder::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let config = ScheduleConfig {
            run_timeout: Duration::from_millis(50),
            ..every(Duration::from_millis(100))
        };
        let handle = schedule("stuck", job, config, &cancel);

        sleep(Duration::from_millis(420)).await;
        let report = handle.stop().await;
        assert!(report.stats.timed_out >= 3);
        assert!(report.stats.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_unit() {
        let job = Recorder::with_result(Duration::ZERO, || {
            Err(CollectError::Fatal("child exited".to_string()))
        });
        let cancel = CancellationToken::new();
        let handle = schedule("broken", job.clone(), every(Duration::from_millis(100)), &cancel);

        let report = handle.join().await;
        assert!(!report.stats.healthy);
        assert_eq!(report.stats.runs, 1);
        assert_eq!(job.fires().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_run_after_grace() {
        let job = Recorder::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let config = ScheduleConfig {
            interval: None,
            shutdown_grace: Duration::from_millis(100),
            ..ScheduleConfig::default()
        };
        let handle = schedule("long", job, config, &cancel);
        let mut state = handle.subscribe();
        handle.trigger();
        state
            .wait_for(|s| *s == UnitState::Running)
            .await
            .expect("unit alive");

        cancel.cancel();
        let report = handle.join().await;
        assert!(report.incomplete);
        assert_eq!(report.stats.runs, 1);
    }

    #[test]
    fn test_align_delay() {
        let interval = Duration::from_secs(10);
        assert_eq!(
            align_delay(Duration::from_millis(123_400), interval),
            Duration::from_millis(6_600)
        );
        assert_eq!(align_delay(Duration::from_secs(120), interval), interval);
        assert_eq!(align_delay(Duration::from_secs(7), Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_advance_skips_missed_boundaries() {
        let base = Instant::now();
        let interval = Duration::from_millis(100);
        assert_eq!(advance(base, interval, base), base + interval);
        assert_eq!(
            advance(base, interval, base + Duration::from_millis(350)),
            base + Duration::from_millis(400)
        );
    }
}
