// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of a whole pipeline.
//!
//! [`AgentBuilder`] collects producers, transforms and sinks; [`Agent::start`] spawns one
//! scheduled unit per collector and one flusher task per sink and returns an
//! [`AgentHandle`]. Stopping goes producers first: every unit is cancelled and given its
//! grace period, service collectors are stopped, and only then are the flushers
//! cancelled so they can deliver what the producers left behind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::buffer::{Buffer, BufferStats};
use crate::errors::CollectError;
use crate::flusher::{Flusher, FlusherConfig, FlusherStats, Sink};
use crate::router::{Accumulator, MetricFilter, Output, Route, Router, RouterStats, Transform};
use crate::scheduler::{schedule, Job, ScheduleConfig, UnitHandle, UnitReport, UnitStats};

/// A source of metrics.
///
/// Polled collectors only implement [`Collector::gather`]. Service collectors, which
/// produce on their own (a listener, a child process), also get the accumulator once
/// through [`Collector::start`] and are told to wind down with [`Collector::stop`].
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Pushes the current measurements into `acc`.
    async fn gather(&self, acc: &Accumulator) -> Result<(), CollectError>;

    async fn start(&self, _acc: Accumulator) -> Result<(), CollectError> {
        Ok(())
    }

    async fn stop(&self) {}

    /// Whether the collector can still produce. Service collectors report a dead
    /// source here without waiting for the next gather.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Adapts a collector to the scheduler.
pub(crate) struct GatherJob {
    collector: Arc<dyn Collector>,
    acc: Accumulator,
}

impl GatherJob {
    pub(crate) fn new(collector: Arc<dyn Collector>, acc: Accumulator) -> Self {
        Self { collector, acc }
    }
}

#[async_trait]
impl Job for GatherJob {
    async fn run(&self) -> Result<(), CollectError> {
        self.collector.gather(&self.acc).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct CollectorEntry {
    collector: Arc<dyn Collector>,
    schedule: ScheduleConfig,
    precision: Duration,
}

struct SinkEntry {
    sink: Arc<dyn Sink>,
    config: FlusherConfig,
    buffer_limit: usize,
    filter: Option<MetricFilter>,
}

#[derive(Default)]
pub struct AgentBuilder {
    collectors: Vec<CollectorEntry>,
    sinks: Vec<SinkEntry>,
    transforms: Vec<Arc<dyn Transform>>,
    routes: Vec<(String, Vec<Arc<dyn Transform>>)>,
}

impl AgentBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn collector(
        mut self,
        collector: Arc<dyn Collector>,
        schedule: ScheduleConfig,
        precision: Duration,
    ) -> Self {
        self.collectors.push(CollectorEntry {
            collector,
            schedule,
            precision,
        });
        self
    }

    /// Appends a transform to the default route.
    #[must_use]
    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Gives `producer` its own transform chain instead of the default one.
    #[must_use]
    pub fn route(mut self, producer: impl Into<String>, transforms: Vec<Arc<dyn Transform>>) -> Self {
        self.routes.push((producer.into(), transforms));
        self
    }

    #[must_use]
    pub fn sink(
        mut self,
        sink: Arc<dyn Sink>,
        config: FlusherConfig,
        buffer_limit: usize,
        filter: Option<MetricFilter>,
    ) -> Self {
        self.sinks.push(SinkEntry {
            sink,
            config,
            buffer_limit,
            filter,
        });
        self
    }

    /// Wires buffers, flushers and routes. Nothing runs until [`Agent::start`].
    #[must_use]
    pub fn build(self) -> Agent {
        let mut outputs = Vec::with_capacity(self.sinks.len());
        let mut flushers = Vec::with_capacity(self.sinks.len());
        for entry in self.sinks {
            let buffer = Arc::new(
                Buffer::new(entry.sink.name(), entry.buffer_limit)
                    .with_flush_threshold(entry.config.batch_size),
            );
            let mut output = Output::new(Arc::clone(&buffer));
            if let Some(filter) = entry.filter {
                output = output.with_filter(filter);
            }
            outputs.push(output);
            flushers.push(Arc::new(Flusher::new(entry.sink, buffer, entry.config)));
        }

        let make_route = |name: &str, transforms: Vec<Arc<dyn Transform>>| {
            let route = transforms
                .into_iter()
                .fold(Route::new(name), Route::with_transform);
            outputs.iter().cloned().fold(route, Route::with_output)
        };

        let mut router = Router::new(make_route("default", self.transforms));
        for (producer, transforms) in self.routes {
            let route = make_route(&producer, transforms);
            router = router.with_route(producer, route);
        }

        Agent {
            router: Arc::new(router),
            collectors: self.collectors,
            flushers,
        }
    }
}

/// A wired but not yet running pipeline.
pub struct Agent {
    router: Arc<Router>,
    collectors: Vec<CollectorEntry>,
    flushers: Vec<Arc<Flusher>>,
}

impl Agent {
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Spawns every flusher and schedules every collector.
    ///
    /// A collector whose `start` fails is logged and left out; the rest of the pipeline
    /// keeps running.
    pub async fn start(self) -> AgentHandle {
        let (status_tx, _) = watch::channel(AgentStatus::Starting);
        let collect_cancel = CancellationToken::new();
        let flush_cancel = CancellationToken::new();

        let flusher_tasks = self
            .flushers
            .iter()
            .map(|flusher| {
                let span = info_span!("flusher", sink = flusher.sink_name());
                tokio::spawn(Arc::clone(flusher).run(flush_cancel.clone()).instrument(span))
            })
            .collect();

        let mut units = Vec::with_capacity(self.collectors.len());
        let mut collectors = Vec::with_capacity(self.collectors.len());
        for entry in self.collectors {
            let name = entry.collector.name().to_string();
            let acc = self.router.accumulator(&name, entry.precision);
            if let Err(e) = entry.collector.start(acc.clone()).await {
                error!(collector = %name, "Failed to start collector: {e}");
                continue;
            }
            let job = Arc::new(GatherJob::new(Arc::clone(&entry.collector), acc));
            units.push(schedule(name, job, entry.schedule, &collect_cancel));
            collectors.push(entry.collector);
        }

        status_tx.send_replace(AgentStatus::Running);
        info!(
            collectors = units.len(),
            sinks = self.flushers.len(),
            "Agent running"
        );

        AgentHandle {
            status: status_tx,
            router: self.router,
            units,
            collectors,
            flushers: self.flushers,
            flusher_tasks,
            collect_cancel,
            flush_cancel,
        }
    }
}

/// What every part of the pipeline did, returned by [`AgentHandle::stop`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub units: Vec<UnitReport>,
    pub sinks: Vec<FlusherStats>,
    pub buffers: Vec<BufferStats>,
    pub router: RouterStats,
}

/// Control surface of a running pipeline.
pub struct AgentHandle {
    status: watch::Sender<AgentStatus>,
    router: Arc<Router>,
    units: Vec<UnitHandle>,
    collectors: Vec<Arc<dyn Collector>>,
    flushers: Vec<Arc<Flusher>>,
    flusher_tasks: Vec<JoinHandle<FlusherStats>>,
    collect_cancel: CancellationToken,
    flush_cancel: CancellationToken,
}

impl AgentHandle {
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    /// Fires the named collector now. Returns false when no such collector runs.
    pub fn trigger(&self, collector: &str) -> bool {
        match self.units.iter().find(|u| u.name() == collector) {
            Some(unit) => {
                unit.trigger();
                true
            }
            None => false,
        }
    }

    /// Asks every sink for an immediate flush.
    pub fn flush(&self) {
        for flusher in &self.flushers {
            flusher.request_flush();
        }
    }

    /// Accumulator for metrics produced outside any collector.
    #[must_use]
    pub fn accumulator(&self, producer: &str, precision: Duration) -> Accumulator {
        self.router.accumulator(producer, precision)
    }

    #[must_use]
    pub fn unit_stats(&self) -> Vec<(String, UnitStats)> {
        self.units
            .iter()
            .map(|u| (u.name().to_string(), u.stats()))
            .collect()
    }

    /// False once any unit has stopped on a fatal error or any collector reports
    /// itself unhealthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.units.iter().all(UnitHandle::is_healthy)
            && self.collectors.iter().all(|c| c.is_healthy())
    }

    /// Stops producers, then sinks, and reports what happened.
    pub async fn stop(self) -> ShutdownReport {
        self.status.send_replace(AgentStatus::Stopping);
        info!("Stopping agent");

        self.collect_cancel.cancel();
        let units = join_all(self.units.into_iter().map(UnitHandle::join)).await;
        for collector in &self.collectors {
            debug!(collector = collector.name(), "Stopping collector");
            collector.stop().await;
        }

        self.flush_cancel.cancel();
        let mut sinks = Vec::with_capacity(self.flusher_tasks.len());
        for (mut task, flusher) in self.flusher_tasks.into_iter().zip(&self.flushers) {
            // Final flush and sink close each get one grace period.
            let limit = flusher.shutdown_grace() * 2;
            match timeout(limit, &mut task).await {
                Ok(Ok(stats)) => sinks.push(stats),
                Ok(Err(e)) => {
                    error!(sink = flusher.sink_name(), "Flusher task failed: {e}");
                    sinks.push(flusher.stats());
                }
                Err(_) => {
                    error!(
                        sink = flusher.sink_name(),
                        "Flusher still running after {limit:?}, aborting it"
                    );
                    task.abort();
                    flusher.buffer().reject_all();
                    sinks.push(flusher.stats());
                }
            }
        }
        let buffers = self.flushers.iter().map(|f| f.buffer().stats()).collect();

        self.status.send_replace(AgentStatus::Stopped);
        info!("Agent stopped");
        ShutdownReport {
            units,
            sinks,
            buffers,
            router: self.router.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SinkError;
    use crate::flusher::RetryStrategy;
    use crate::metric::Metric;
    use crate::tracking::{Disposition, Tracker};
    use crate::transforms::{DropUnencodable, TagEnricher};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    struct Counter {
        name: String,
        gathered: AtomicU64,
    }

    impl Counter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                gathered: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Collector for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn gather(&self, acc: &Accumulator) -> Result<(), CollectError> {
            let n = self.gathered.fetch_add(1, Ordering::SeqCst);
            acc.add_metric(
                Metric::new(&self.name)
                    .with_field("n", n)
                    .with_timestamp(1_000),
            );
            Ok(())
        }
    }

    /// Service collector that emits one last metric when stopped.
    struct Farewell {
        acc: Mutex<Option<Accumulator>>,
    }

    #[async_trait]
    impl Collector for Farewell {
        fn name(&self) -> &str {
            "farewell"
        }

        async fn gather(&self, _acc: &Accumulator) -> Result<(), CollectError> {
            Ok(())
        }

        async fn start(&self, acc: Accumulator) -> Result<(), CollectError> {
            *self.acc.lock().expect("lock poisoned") = Some(acc);
            Ok(())
        }

        async fn stop(&self) {
            if let Some(acc) = self.acc.lock().expect("lock poisoned").take() {
                acc.add_metric(Metric::new("farewell").with_field("bye", true));
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl Collector for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn gather(&self, _acc: &Accumulator) -> Result<(), CollectError> {
            Ok(())
        }

        async fn start(&self, _acc: Accumulator) -> Result<(), CollectError> {
            Err(CollectError::Fatal("no such device".to_string()))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        fail: bool,
        written: Mutex<Vec<Metric>>,
    }

    #[async_trait]
    impl Sink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }

        async fn write(&self, metrics: &[Metric]) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Transient("down".to_string()));
            }
            self.written
                .lock()
                .expect("lock poisoned")
                .extend(metrics.iter().map(Metric::clone_untracked));
            Ok(())
        }
    }

    fn every(ms: u64) -> ScheduleConfig {
        ScheduleConfig {
            interval: Some(Duration::from_millis(ms)),
            ..ScheduleConfig::default()
        }
    }

    fn flush_config() -> FlusherConfig {
        FlusherConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            retry_strategy: RetryStrategy::Immediate(1),
            ..FlusherConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_route_and_flush() {
        let counter = Counter::new("cpu");
        let sink = Arc::new(MemorySink::default());
        let agent = AgentBuilder::new()
            .collector(counter.clone(), every(100), Duration::ZERO)
            .transform(Arc::new(TagEnricher::new(
                [("host".to_string(), "a".to_string())].into(),
            )))
            .sink(sink.clone(), flush_config(), 1_000, None)
            .build();

        let handle = agent.start().await;
        assert_eq!(handle.status(), AgentStatus::Running);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        let report = handle.stop().await;

        let gathered = counter.gathered.load(Ordering::SeqCst);
        assert_eq!(gathered, 10);
        let written = sink.written.lock().expect("lock poisoned");
        assert_eq!(written.len() as u64, gathered);
        assert!(written.iter().all(|m| m.tag("host") == Some("a")));

        assert_eq!(report.units.len(), 1);
        assert_eq!(report.units[0].stats.runs, gathered);
        assert_eq!(report.sinks[0].accepted, gathered);
        assert_eq!(report.router.routed, gathered);
        assert_eq!(report.buffers[0].len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_producer_route() {
        let sink = Arc::new(MemorySink::default());
        let agent = AgentBuilder::new()
            .collector(Counter::new("cpu"), every(100), Duration::ZERO)
            .collector(Counter::new("mem"), every(100), Duration::ZERO)
            .route(
                "mem",
                vec![Arc::new(TagEnricher::new(
                    [("kind".to_string(), "memory".to_string())].into(),
                ))],
            )
            .sink(sink.clone(), flush_config(), 1_000, None)
            .build();

        let handle = agent.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        let written = sink.written.lock().expect("lock poisoned");
        for metric in written.iter() {
            let expected = (metric.name.as_str() == "mem").then_some("memory");
            assert_eq!(metric.tag("kind"), expected);
        }
        assert_eq!(written.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_what_service_collectors_leave_behind() {
        let sink = Arc::new(MemorySink::default());
        let farewell = Arc::new(Farewell {
            acc: Mutex::new(None),
        });
        let agent = AgentBuilder::new()
            .collector(
                farewell,
                ScheduleConfig {
                    interval: None,
                    ..ScheduleConfig::default()
                },
                Duration::ZERO,
            )
            .sink(sink.clone(), flush_config(), 1_000, None)
            .build();

        let handle = agent.start().await;
        let report = handle.stop().await;

        let written = sink.written.lock().expect("lock poisoned");
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].name.as_str(), "farewell");
        assert_eq!(report.sinks[0].accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_leaves_collector_out() {
        let agent = AgentBuilder::new()
            .collector(Arc::new(Broken), every(100), Duration::ZERO)
            .collector(Counter::new("cpu"), every(100), Duration::ZERO)
            .build();

        let handle = agent.start().await;
        assert!(!handle.trigger("broken"));
        assert!(handle.trigger("cpu"));
        let report = handle.stop().await;
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.units[0].name, "cpu");
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeliverable_metrics_are_rejected_at_stop() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..MemorySink::default()
        });
        let agent = AgentBuilder::new()
            .sink(sink, flush_config(), 1_000, None)
            .build();
        let handle = agent.start().await;

        let (tracker, mut deliveries) = Tracker::new();
        let acc = handle
            .accumulator("external", Duration::ZERO)
            .with_tracker(tracker);
        for i in 0..3_i64 {
            acc.add_tracked(Metric::new("queue").with_field("depth", i))
                .await
                .expect("tracked");
        }

        let report = handle.stop().await;
        assert_eq!(report.sinks[0].accepted, 0);
        assert_eq!(report.sinks[0].rejected, 3);
        for _ in 0..3 {
            let info = deliveries.recv().await.expect("notified");
            assert_eq!(info.disposition, Disposition::Reject);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_filters() {
        let cpu_only = Arc::new(MemorySink::default());
        let everything = Arc::new(MemorySink::default());
        let agent = AgentBuilder::new()
            .sink(
                cpu_only.clone(),
                flush_config(),
                1_000,
                Some(MetricFilter::new(&["cpu*"], &[]).expect("globs")),
            )
            .sink(everything.clone(), flush_config(), 1_000, None)
            .build();
        let handle = agent.start().await;

        let acc = handle.accumulator("external", Duration::ZERO);
        acc.add_metric(Metric::new("cpu_user").with_field("v", 1.0));
        acc.add_metric(Metric::new("mem").with_field("v", 2.0));
        handle.flush();
        let report = handle.stop().await;

        assert_eq!(cpu_only.written.lock().expect("lock poisoned").len(), 1);
        assert_eq!(everything.written.lock().expect("lock poisoned").len(), 2);
        assert_eq!(report.router.routed, 2);
    }

    /// Service collector whose source can go away between gathers.
    struct Listener {
        alive: AtomicBool,
    }

    #[async_trait]
    impl Collector for Listener {
        fn name(&self) -> &str {
            "listener"
        }

        async fn gather(&self, _acc: &Accumulator) -> Result<(), CollectError> {
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_service_collector_without_gathers() {
        let listener = Arc::new(Listener {
            alive: AtomicBool::new(true),
        });
        let handle = AgentBuilder::new()
            .collector(
                listener.clone(),
                ScheduleConfig {
                    interval: None,
                    ..ScheduleConfig::default()
                },
                Duration::ZERO,
            )
            .build()
            .start()
            .await;
        assert!(handle.is_healthy());

        listener.alive.store(false, Ordering::SeqCst);
        assert!(!handle.is_healthy());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_while_a_batch_is_retrying() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..MemorySink::default()
        });
        let agent = AgentBuilder::new()
            .sink(
                sink,
                FlusherConfig {
                    retry_strategy: RetryStrategy::LinearBackoff(5, 10_000),
                    shutdown_grace: Duration::from_millis(500),
                    ..flush_config()
                },
                1_000,
                None,
            )
            .build();
        let handle = agent.start().await;

        let (tracker, mut deliveries) = Tracker::new();
        let acc = handle
            .accumulator("external", Duration::ZERO)
            .with_tracker(tracker);
        acc.add_tracked(Metric::new("queue").with_field("depth", 1_i64))
            .await
            .expect("tracked");
        handle.flush();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        let report = handle.stop().await;
        assert!(started.elapsed() <= Duration::from_secs(1));
        assert_eq!(report.sinks[0].rejected, 1);
        assert_eq!(
            deliveries.recv().await.expect("notified").disposition,
            Disposition::Reject
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unencodable_metrics_are_dropped_not_accepted() {
        let sink = Arc::new(MemorySink::default());
        let handle = AgentBuilder::new()
            .transform(Arc::new(DropUnencodable))
            .sink(sink.clone(), flush_config(), 1_000, None)
            .build()
            .start()
            .await;

        let (tracker, mut deliveries) = Tracker::new();
        let acc = handle
            .accumulator("external", Duration::ZERO)
            .with_tracker(tracker);
        let nan = acc
            .add_tracked(Metric::new("cpu").with_field("v", f64::NAN))
            .await
            .expect("tracked");
        let fine = acc
            .add_tracked(Metric::new("cpu").with_field("v", 1.5))
            .await
            .expect("tracked");
        handle.stop().await;

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let info = deliveries.recv().await.expect("notified");
            outcomes.push((info.id, info.disposition));
        }
        assert!(outcomes.contains(&(nan, Disposition::Drop)));
        assert!(outcomes.contains(&(fine, Disposition::Accept)));
        assert_eq!(sink.written.lock().expect("lock poisoned").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_transitions() {
        let handle = AgentBuilder::new().build().start().await;
        let rx = handle.subscribe();
        assert_eq!(*rx.borrow(), AgentStatus::Running);
        assert!(handle.is_healthy());
        handle.stop().await;
        assert_eq!(*rx.borrow(), AgentStatus::Stopped);
    }
}
