// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use telemetry_pipeline::{
    agent::{AgentBuilder, Collector},
    buffer::Buffer,
    errors::{CollectError, SinkError},
    flusher::{Flusher, FlusherConfig, RetryStrategy, Sink},
    line_protocol::{parse, serialize},
    metric::Metric,
    router::{Accumulator, Output, Route},
    scheduler::ScheduleConfig,
    tracking::{Disposition, Tracker},
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fails the first `failures` writes, then keeps what it receives.
struct OutageSink {
    failures: AtomicU64,
    received: Mutex<Vec<String>>,
}

impl OutageSink {
    fn new(failures: u64) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU64::new(failures),
            received: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Sink for OutageSink {
    fn name(&self) -> &str {
        "outage"
    }

    async fn write(&self, metrics: &[Metric]) -> Result<(), SinkError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Transient("connection refused".to_string()));
        }
        let mut received = self.received.lock().expect("lock poisoned");
        received.extend(metrics.iter().map(|m| serialize(m).expect("serializable")));
        Ok(())
    }
}

async fn deliver_through_outage(attempts: u64) -> (Disposition, usize) {
    let sink = OutageSink::new(2);
    let buffer = Arc::new(Buffer::new("outage", 100));
    let route = Arc::new(Route::new("default").with_output(Output::new(Arc::clone(&buffer))));
    let (tracker, mut deliveries) = Tracker::new();
    let acc = Accumulator::for_route("test", route).with_tracker(tracker);

    acc.add_tracked(Metric::new("cpu").with_tag("host", "a").with_field("usage", 1.5))
        .await
        .expect("tracked");

    let flusher = Flusher::new(
        sink.clone(),
        buffer,
        FlusherConfig {
            retry_strategy: RetryStrategy::Immediate(attempts),
            ..FlusherConfig::default()
        },
    );
    let _ = flusher.flush().await;

    let info = deliveries.recv().await.expect("notified");
    let received = sink.received.lock().expect("lock poisoned").len();
    (info.disposition, received)
}

#[tokio::test]
async fn retries_ride_out_a_short_outage() {
    assert_eq!(deliver_through_outage(3).await, (Disposition::Accept, 1));
}

#[tokio::test]
async fn exhausted_retries_reject_the_batch() {
    assert_eq!(deliver_through_outage(2).await, (Disposition::Reject, 0));
}

struct Sequence {
    next: AtomicU64,
}

#[async_trait]
impl Collector for Sequence {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn gather(&self, acc: &Accumulator) -> Result<(), CollectError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        acc.add_metric(
            Metric::new("seq")
                .with_field("n", n)
                .with_timestamp(1_000_000_123),
        );
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn agent_preserves_producer_order_and_precision() {
    let sink = OutageSink::new(0);
    let handle = AgentBuilder::new()
        .collector(
            Arc::new(Sequence {
                next: AtomicU64::new(0),
            }),
            ScheduleConfig {
                interval: Some(Duration::from_millis(10)),
                ..ScheduleConfig::default()
            },
            Duration::from_millis(1),
        )
        .sink(
            sink.clone(),
            FlusherConfig {
                batch_size: 7,
                flush_interval: Duration::from_millis(50),
                ..FlusherConfig::default()
            },
            1_000,
            None,
        )
        .build()
        .start()
        .await;

    tokio::time::sleep(Duration::from_millis(305)).await;
    let report = handle.stop().await;

    let received = sink.received.lock().expect("lock poisoned");
    assert_eq!(received.len(), 30);
    for (i, line) in received.iter().enumerate() {
        assert_eq!(*line, format!("seq n={i}u 1000000000\n"));
    }
    assert_eq!(report.sinks[0].accepted, 30);
    assert_eq!(report.units[0].stats.skipped, 0);
}

#[tokio::test]
async fn cancelled_flusher_rejects_what_it_cannot_deliver() {
    let sink = OutageSink::new(u64::MAX);
    let buffer = Arc::new(Buffer::new("outage", 100));
    let (tracker, mut deliveries) = Tracker::new();
    for i in 0..5_i64 {
        let (metric, _) = tracker.track(Metric::new("queue").with_field("depth", i));
        buffer.add(metric);
    }

    let flusher = Arc::new(Flusher::new(
        sink,
        Arc::clone(&buffer),
        FlusherConfig {
            batch_size: 2,
            retry_strategy: RetryStrategy::Immediate(1),
            ..FlusherConfig::default()
        },
    ));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = flusher.run(cancel).await;

    assert!(buffer.is_empty());
    assert_eq!(stats.accepted, 0);
    assert_eq!(stats.rejected + stats.abandoned, 5);
    for _ in 0..5 {
        assert_eq!(
            deliveries.recv().await.expect("notified").disposition,
            Disposition::Reject
        );
    }
}

#[cfg(unix)]
mod shim_processes {
    use super::*;
    use telemetry_pipeline::shim::host::{GatherSignal, ShimCollector, ShimCommand, ShimSink};

    fn sh(script: &str) -> ShimCommand {
        ShimCommand::new("sh").arg("-c").arg(script)
    }

    fn capture() -> (Arc<Buffer>, Accumulator) {
        let buffer = Arc::new(Buffer::new("capture", 100));
        let route = Arc::new(Route::new("capture").with_output(Output::new(Arc::clone(&buffer))));
        (Arc::clone(&buffer), Accumulator::for_route("shim", route))
    }

    #[tokio::test]
    async fn collector_prompts_child_over_stdin() {
        let collector = ShimCollector::new(
            "echo",
            sh("while read line; do echo 'cpu,host=a usage=1.5 1700000000000000000'; done"),
        )
        .with_signal(GatherSignal::Stdin);
        let (buffer, acc) = capture();

        collector.start(acc.clone()).await.expect("started");
        collector.gather(&acc).await.expect("prompted");
        collector.gather(&acc).await.expect("prompted");
        collector.stop().await;

        let metrics = buffer.drain(10).into_vec();
        assert_eq!(metrics.len(), 2);
        let expected = parse("cpu,host=a usage=1.5 1700000000000000000").expect("valid");
        assert!(metrics.iter().all(|m| *m == expected));
    }

    #[tokio::test]
    async fn collector_turns_fatal_once_child_exits() {
        let collector = ShimCollector::new("once", sh("echo 'mem free=3i 1'"));
        let (buffer, acc) = capture();
        collector.start(acc.clone()).await.expect("started");

        for _ in 0..250 {
            if !collector.is_healthy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!collector.is_healthy());
        assert!(matches!(
            collector.gather(&acc).await,
            Err(CollectError::Fatal(_))
        ));
        assert_eq!(buffer.len(), 1);
        collector.stop().await;
    }

    #[tokio::test]
    async fn sink_write_is_acknowledged_by_silence() {
        let sink = ShimSink::new("devnull", sh("cat > /dev/null"));
        sink.connect().await.expect("connected");
        sink.write(&[Metric::new("cpu").with_field("usage", 1.5)])
            .await
            .expect("written");
        sink.close().await.expect("closed");
    }

    #[tokio::test]
    async fn sink_error_line_fails_the_write() {
        let sink = ShimSink::new(
            "refusing",
            sh("while read line; do echo 'E! cannot deliver' >&2; done"),
        )
        .with_ack_window(Duration::from_secs(5));
        sink.connect().await.expect("connected");

        let err = sink
            .write(&[Metric::new("cpu").with_field("usage", 1.5)])
            .await
            .expect_err("child reported an error");
        assert!(matches!(err, SinkError::Transient(_)));
        assert!(sink.is_healthy());
        sink.close().await.expect("closed");
    }

    #[tokio::test]
    async fn sink_child_gone_is_permanent() {
        let sink = ShimSink::new("gone", ShimCommand::new("true"));
        sink.connect().await.expect("connected");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = sink
            .write(&[Metric::new("cpu").with_field("usage", 1.5)])
            .await
            .expect_err("child has exited");
        assert!(err.is_permanent());
        assert!(!sink.is_healthy());
        sink.close().await.expect("closed");
    }

    #[tokio::test]
    async fn processor_streams_output_back() {
        let (buffer, acc) = capture();
        let processor = ShimSink::new("passthrough", ShimCommand::new("cat")).with_output(acc);
        processor.connect().await.expect("connected");

        let sent = vec![
            Metric::new("cpu")
                .with_tag("host", "a")
                .with_field("usage", 1.5)
                .with_timestamp(1),
            Metric::new("mem").with_field("free", 3_i64).with_timestamp(2),
        ];
        processor.write(&sent).await.expect("written");
        processor.close().await.expect("closed");

        assert_eq!(buffer.drain(10).into_vec(), sent);
    }
}
