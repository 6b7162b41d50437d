// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery tracking for metrics.
//!
//! A tracked metric carries a share of a tracking handle. Every path the metric travels
//! (router fan-out, transform clones) holds its own share, and every share is settled
//! exactly once with a [`Disposition`]. When the last share settles, the aggregate
//! outcome is pushed to the producer's notification channel.
//!
//! Aggregation rules:
//! - any `Reject` makes the outcome `Reject`
//! - otherwise any `Accept` makes it `Accept`
//! - otherwise (only drops) the outcome is `Drop`
//!
//! The countdown is a plain atomic and the terminal notification is guarded by a
//! compare-and-swap, so concurrent disposers on different threads can never notify twice.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use derive_more::Display;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::metric::Metric;

static NEXT_TRACKING_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal outcome of a metric's journey through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Disposition {
    /// Delivered successfully.
    #[display("accept")]
    Accept,
    /// Delivery was attempted and failed, or the metric was evicted. The data is lost.
    #[display("reject")]
    Reject,
    /// Intentionally discarded by policy. Not a delivery failure.
    #[display("drop")]
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{_0}")]
pub struct TrackingId(u64);

impl TrackingId {
    fn next() -> Self {
        Self(NEXT_TRACKING_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Notification sent to the producer once every share of a tracking handle has settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub id: TrackingId,
    pub disposition: Disposition,
    pub accepted: u32,
    pub rejected: u32,
    pub dropped: u32,
}

impl DeliveryInfo {
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.disposition == Disposition::Accept
    }
}

struct TrackingState {
    id: TrackingId,
    pending: AtomicUsize,
    accepted: AtomicU32,
    rejected: AtomicU32,
    dropped: AtomicU32,
    notified: AtomicBool,
    notify: mpsc::UnboundedSender<DeliveryInfo>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl TrackingState {
    fn new(
        shares: usize,
        notify: mpsc::UnboundedSender<DeliveryInfo>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: TrackingId::next(),
            pending: AtomicUsize::new(shares),
            accepted: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
            notified: AtomicBool::new(false),
            notify,
            permit: Mutex::new(permit),
        })
    }

    fn counter(&self, disposition: Disposition) -> &AtomicU32 {
        match disposition {
            Disposition::Accept => &self.accepted,
            Disposition::Reject => &self.rejected,
            Disposition::Drop => &self.dropped,
        }
    }

    /// Records one disposition. Returns false if the handle was already terminal.
    fn dispose(&self, disposition: Disposition) -> bool {
        // Count before decrementing so the disposer that reaches zero sees every vote.
        let counter = self.counter(disposition);
        counter.fetch_add(1, Ordering::AcqRel);

        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.finish();
                true
            }
            Ok(_) => true,
            Err(_) => {
                counter.fetch_sub(1, Ordering::AcqRel);
                debug!(id = %self.id, %disposition, "ignoring disposition on settled tracking handle");
                false
            }
        }
    }

    fn aggregate(&self) -> DeliveryInfo {
        let accepted = self.accepted.load(Ordering::Acquire);
        let rejected = self.rejected.load(Ordering::Acquire);
        let dropped = self.dropped.load(Ordering::Acquire);
        let disposition = if rejected > 0 {
            Disposition::Reject
        } else if accepted > 0 {
            Disposition::Accept
        } else {
            Disposition::Drop
        };
        DeliveryInfo {
            id: self.id,
            disposition,
            accepted,
            rejected,
            dropped,
        }
    }

    fn finish(&self) {
        if self
            .notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let info = self.aggregate();
        if self.notify.send(info).is_err() {
            debug!(id = %self.id, "delivery receiver dropped before notification");
        }

        // Frees a slot in a bounded tracker.
        #[allow(clippy::expect_used)]
        self.permit.lock().expect("lock poisoned").take();
    }
}

/// One path's claim on a tracking handle.
///
/// Settling consumes the share. A share dropped without being settled is rejected, since
/// whatever held it lost the metric.
pub(crate) struct TrackingShare {
    state: Arc<TrackingState>,
    settled: bool,
}

impl TrackingShare {
    fn new(state: Arc<TrackingState>) -> Self {
        Self {
            state,
            settled: false,
        }
    }

    pub(crate) fn id(&self) -> TrackingId {
        self.state.id
    }

    /// Creates an additional share for a new fan-out path.
    pub(crate) fn fork(&self) -> Self {
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        Self::new(Arc::clone(&self.state))
    }

    pub(crate) fn settle(mut self, disposition: Disposition) {
        self.settled = true;
        self.state.dispose(disposition);
    }
}

impl Drop for TrackingShare {
    fn drop(&mut self) {
        if !self.settled {
            warn!(id = %self.state.id, "tracked metric discarded without a disposition, rejecting it");
            self.state.dispose(Disposition::Reject);
        }
    }
}

impl fmt::Debug for TrackingShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingShare")
            .field("id", &self.state.id)
            .field("pending", &self.state.pending.load(Ordering::Relaxed))
            .finish()
    }
}

/// Read-only side of a tracking handle, owned by the producer.
#[derive(Debug)]
pub struct DeliveryReceiver {
    rx: mpsc::UnboundedReceiver<DeliveryInfo>,
}

impl DeliveryReceiver {
    /// Waits for the next terminal notification.
    ///
    /// Returns `None` once every tracker and tracked metric feeding this receiver is gone.
    pub async fn recv(&mut self) -> Option<DeliveryInfo> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeliveryInfo> {
        self.rx.try_recv().ok()
    }
}

/// Wraps a metric with a fresh tracking handle and returns the handle's notification source.
///
/// A metric that is already tracked is detached first, settling its previous share as `Drop`.
#[must_use]
pub fn track(metric: Metric) -> (Metric, DeliveryReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = TrackingState::new(1, tx, None);
    (
        metric.detach().with_tracking(TrackingShare::new(state)),
        DeliveryReceiver { rx },
    )
}

/// Tracks many metrics behind a single delivery channel.
///
/// With [`Tracker::with_max_undelivered`], [`Tracker::track_bounded`] waits while the
/// configured number of tracked metrics are still in flight, which gives event-driven
/// producers natural backpressure.
#[derive(Debug, Clone)]
pub struct Tracker {
    tx: mpsc::UnboundedSender<DeliveryInfo>,
    limit: Option<Arc<Semaphore>>,
}

impl Tracker {
    #[must_use]
    pub fn new() -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, limit: None }, DeliveryReceiver { rx })
    }

    #[must_use]
    pub fn with_max_undelivered(max_undelivered: usize) -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                limit: Some(Arc::new(Semaphore::new(max_undelivered))),
            },
            DeliveryReceiver { rx },
        )
    }

    /// Tracks a metric without waiting for capacity.
    #[must_use]
    pub fn track(&self, metric: Metric) -> (Metric, TrackingId) {
        self.track_with_permit(metric, None)
    }

    /// Tracks a metric, waiting until fewer than `max_undelivered` tracked metrics are in flight.
    pub async fn track_bounded(&self, metric: Metric) -> (Metric, TrackingId) {
        let permit = match &self.limit {
            Some(limit) => Arc::clone(limit).acquire_owned().await.ok(),
            None => None,
        };
        self.track_with_permit(metric, permit)
    }

    /// Tracks a group of metrics as one unit: a single notification is sent once every
    /// metric of the group has settled.
    #[must_use]
    pub fn track_group(&self, metrics: Vec<Metric>) -> (Vec<Metric>, Option<TrackingId>) {
        if metrics.is_empty() {
            return (metrics, None);
        }
        let state = TrackingState::new(metrics.len(), self.tx.clone(), None);
        let id = state.id;
        let tracked = metrics
            .into_iter()
            .map(|m| {
                m.detach()
                    .with_tracking(TrackingShare::new(Arc::clone(&state)))
            })
            .collect();
        (tracked, Some(id))
    }

    /// Number of tracked metrics that can still be started without waiting.
    #[must_use]
    pub fn available(&self) -> Option<usize> {
        self.limit.as_ref().map(|l| l.available_permits())
    }

    fn track_with_permit(
        &self,
        metric: Metric,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (Metric, TrackingId) {
        let state = TrackingState::new(1, self.tx.clone(), permit);
        let id = state.id;
        (
            metric.detach().with_tracking(TrackingShare::new(state)),
            id,
        )
    }
}
