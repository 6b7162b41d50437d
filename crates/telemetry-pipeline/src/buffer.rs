// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-sink metric buffer.
//!
//! The buffer is the pipeline's load-shedding point: producers never block on it.
//! When it is full, the oldest metric is evicted and rejected so the newest data,
//! the most useful for monitoring, is what survives a sink outage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::metric::Metric;

/// Counters exposed for instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub name: String,
    pub capacity: usize,
    pub len: usize,
    pub added: u64,
    /// Evicted because the buffer was full.
    pub dropped: u64,
    /// Still buffered when the pipeline shut down.
    pub rejected: u64,
}

#[derive(Debug)]
pub struct Buffer {
    name: String,
    capacity: usize,
    flush_threshold: usize,
    metrics: Mutex<VecDeque<Metric>>,
    added: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    batch_ready: Notify,
}

impl Buffer {
    /// Creates a buffer holding at most `capacity` metrics (at least one).
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            flush_threshold: capacity,
            metrics: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            added: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            batch_ready: Notify::new(),
        }
    }

    /// Signals batch readiness once the buffer holds `threshold` metrics. Defaults to the
    /// capacity.
    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.clamp(1, self.capacity);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a metric, evicting (and rejecting) the oldest one if the buffer is full.
    /// Returns whether an eviction happened.
    pub fn add(&self, metric: Metric) -> bool {
        let (evicted, len) = {
            #[allow(clippy::expect_used)]
            let mut metrics = self.metrics.lock().expect("lock poisoned");
            let evicted = if metrics.len() >= self.capacity {
                metrics.pop_front()
            } else {
                None
            };
            metrics.push_back(metric);
            (evicted, metrics.len())
        };
        self.added.fetch_add(1, Ordering::Relaxed);

        if len >= self.flush_threshold {
            self.batch_ready.notify_one();
        }

        match evicted {
            Some(oldest) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    buffer = %self.name,
                    "Buffer full ({} metrics), dropping oldest metric {}",
                    self.capacity, oldest.name
                );
                oldest.reject();
                true
            }
            None => false,
        }
    }

    /// Appends every metric in order. Returns the number of evictions.
    pub fn add_all(&self, metrics: impl IntoIterator<Item = Metric>) -> usize {
        metrics.into_iter().map(|m| self.add(m)).filter(|evicted| *evicted).count()
    }

    /// Atomically removes up to `max` metrics from the head.
    #[must_use]
    pub fn drain(&self, max: usize) -> Batch {
        #[allow(clippy::expect_used)]
        let mut metrics = self.metrics.lock().expect("lock poisoned");
        let n = max.min(metrics.len());
        Batch {
            metrics: metrics.drain(..n).collect(),
        }
    }

    /// Waits until the buffer crosses its flush threshold.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await;
    }

    /// Rejects everything still buffered. Used once delivery is no longer possible.
    pub fn reject_all(&self) -> usize {
        let leftover: Vec<Metric> = {
            #[allow(clippy::expect_used)]
            let mut metrics = self.metrics.lock().expect("lock poisoned");
            metrics.drain(..).collect()
        };
        let n = leftover.len();
        if n > 0 {
            self.rejected.fetch_add(n as u64, Ordering::Relaxed);
            warn!(buffer = %self.name, "Rejecting {n} undelivered metrics");
            Batch { metrics: leftover }.reject_all();
        } else {
            debug!(buffer = %self.name, "Buffer empty at shutdown");
        }
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.metrics.lock().expect("lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            name: self.name.clone(),
            capacity: self.capacity,
            len: self.len(),
            added: self.added.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Ordered group of metrics drained for one flush, retries included.
#[derive(Debug, Default)]
pub struct Batch {
    metrics: Vec<Metric>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Metric> {
        self.metrics.iter()
    }

    pub fn accept_all(self) {
        self.metrics.into_iter().for_each(Metric::accept);
    }

    pub fn reject_all(self) {
        self.metrics.into_iter().for_each(Metric::reject);
    }

    pub fn drop_all(self) {
        self.metrics.into_iter().for_each(Metric::drop_metric);
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Metric> {
        self.metrics
    }
}

impl From<Vec<Metric>> for Batch {
    fn from(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }
}

impl IntoIterator for Batch {
    type Item = Metric;
    type IntoIter = std::vec::IntoIter<Metric>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::FieldValue;
    use crate::tracking::{Disposition, Tracker};
    use proptest::prelude::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn numbered(i: i64) -> Metric {
        Metric::new("seq").with_field("n", i).with_timestamp(i)
    }

    fn numbers(batch: &Batch) -> Vec<i64> {
        batch
            .iter()
            .map(|m| match m.field("n") {
                Some(FieldValue::Int(n)) => *n,
                other => panic!("unexpected field {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_drain_is_fifo() {
        let buffer = Buffer::new("out", 10);
        for i in 0..5 {
            assert!(!buffer.add(numbered(i)));
        }
        assert_eq!(numbers(&buffer.drain(3)), vec![0, 1, 2]);
        assert_eq!(numbers(&buffer.drain(10)), vec![3, 4]);
        assert!(buffer.drain(10).is_empty());
    }

    #[test]
    #[traced_test]
    fn test_full_buffer_evicts_oldest_as_reject() {
        let (tracker, mut rx) = Tracker::new();
        let buffer = Buffer::new("out", 2);
        let (first, first_id) = tracker.track(numbered(0));
        buffer.add(first);
        buffer.add(numbered(1));
        assert!(buffer.is_full());

        assert!(buffer.add(numbered(2)));
        let info = rx.try_recv().expect("evicted metric notified");
        assert_eq!(info.id, first_id);
        assert_eq!(info.disposition, Disposition::Reject);
        assert!(logs_contain("dropping oldest metric"));

        let stats = buffer.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.added, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_drain_and_readd_preserves_relative_order() {
        let buffer = Buffer::new("out", 10);
        for i in 0..6 {
            buffer.add(numbered(i));
        }
        let requeued = buffer.drain(2);
        buffer.add_all(requeued);
        assert_eq!(numbers(&buffer.drain(10)), vec![2, 3, 4, 5, 0, 1]);
    }

    #[test]
    fn test_reject_all_disposes_leftovers() {
        let (tracker, mut rx) = Tracker::new();
        let buffer = Buffer::new("out", 10);
        for i in 0..3 {
            buffer.add(tracker.track(numbered(i)).0);
        }
        assert_eq!(buffer.reject_all(), 3);
        assert!(buffer.is_empty());
        for _ in 0..3 {
            assert_eq!(
                rx.try_recv().expect("notified").disposition,
                Disposition::Reject
            );
        }
        assert_eq!(buffer.stats().rejected, 3);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = Buffer::new("out", 0);
        assert_eq!(buffer.capacity(), 1);
        buffer.add(numbered(0));
        assert!(buffer.add(numbered(1)));
        assert_eq!(numbers(&buffer.drain(5)), vec![1]);
    }

    #[test]
    fn test_stats_serialize() {
        let buffer = Buffer::new("out", 4);
        buffer.add(numbered(1));
        let json = serde_json::to_value(buffer.stats()).expect("serializable");
        assert_eq!(json["name"], "out");
        assert_eq!(json["len"], 1);
        assert_eq!(json["capacity"], 4);
    }

    #[tokio::test]
    async fn test_batch_ready_fires_at_threshold() {
        let buffer = Buffer::new("out", 10).with_flush_threshold(2);
        buffer.add(numbered(0));
        let not_yet = tokio::time::timeout(Duration::from_millis(20), buffer.batch_ready()).await;
        assert!(not_yet.is_err());

        buffer.add(numbered(1));
        tokio::time::timeout(Duration::from_secs(1), buffer.batch_ready())
            .await
            .expect("batch ready");
    }

    #[test]
    fn test_concurrent_add_and_drain() {
        let buffer = std::sync::Arc::new(Buffer::new("out", 100_000));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = std::sync::Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        buffer.add(numbered(w * 1_000 + i));
                    }
                })
            })
            .collect();
        let mut drained = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            drained += buffer.drain(64).len();
        }
        for w in writers {
            w.join().expect("writer panicked");
        }
        drained += buffer.drain(usize::MAX).len();
        assert_eq!(drained, 4_000);
    }

    proptest! {
        #[test]
        fn prop_keeps_newest_and_rejects_evicted(capacity in 1usize..32, inserts in 0usize..96) {
            let (tracker, mut rx) = Tracker::new();
            let buffer = Buffer::new("out", capacity);
            let mut ids = Vec::new();
            for i in 0..inserts {
                let (metric, id) = tracker.track(numbered(i as i64));
                ids.push(id);
                buffer.add(metric);
            }

            let evicted = inserts.saturating_sub(capacity);
            let mut rejected = Vec::new();
            while let Some(info) = rx.try_recv() {
                prop_assert_eq!(info.disposition, Disposition::Reject);
                rejected.push(info.id);
            }
            prop_assert_eq!(&rejected[..], &ids[..evicted]);

            let batch = buffer.drain(usize::MAX);
            let expected: Vec<i64> = (evicted..inserts).map(|i| i as i64).collect();
            prop_assert_eq!(numbers(&batch), expected);
            batch.accept_all();
        }
    }
}
