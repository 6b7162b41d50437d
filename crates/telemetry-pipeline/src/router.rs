// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routing of produced metrics to sink buffers.
//!
//! A [`Route`] runs a metric through its transforms in order and enqueues every result
//! into each output whose filter accepts it. Fan-out forks the tracking share once per
//! extra output so the producer hears back only after every sink has settled.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::buffer::Buffer;
use crate::errors::ConfigError;
use crate::metric::{now_nanos, Fields, Metric, Tags};
use crate::tracking::{Tracker, TrackingId};
use crate::util::glob_to_regex;

/// Turns one metric into zero or more metrics.
///
/// Whatever is not forwarded must be disposed by the transform (usually with
/// [`Metric::drop_metric`]); a tracked metric that is silently discarded counts as
/// rejected.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, metric: Metric) -> Vec<Metric>;
}

/// Name based selection, `namepass` / `namedrop` style.
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    namepass: Vec<Regex>,
    namedrop: Vec<Regex>,
}

impl MetricFilter {
    /// Builds a filter from glob patterns. An empty `namepass` lets every name through.
    pub fn new<S: AsRef<str>>(namepass: &[S], namedrop: &[S]) -> Result<Self, ConfigError> {
        let compile = |globs: &[S]| {
            globs
                .iter()
                .map(|g| {
                    glob_to_regex(g.as_ref()).map_err(|e| {
                        ConfigError::InvalidConfig(format!("bad name pattern {}: {e}", g.as_ref()))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            namepass: compile(namepass)?,
            namedrop: compile(namedrop)?,
        })
    }

    #[must_use]
    pub fn matches(&self, metric: &Metric) -> bool {
        let name = metric.name.as_str();
        if !self.namepass.is_empty() && !self.namepass.iter().any(|re| re.is_match(name)) {
            return false;
        }
        !self.namedrop.iter().any(|re| re.is_match(name))
    }
}

/// A sink buffer subscribed to a route.
#[derive(Debug, Clone)]
pub struct Output {
    pub buffer: Arc<Buffer>,
    pub filter: Option<MetricFilter>,
}

impl Output {
    #[must_use]
    pub fn new(buffer: Arc<Buffer>) -> Self {
        Self {
            buffer,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: MetricFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    fn accepts(&self, metric: &Metric) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(metric))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Metrics enqueued into at least one buffer.
    pub routed: u64,
    /// Metrics no output wanted.
    pub filtered: u64,
    pub rejected_invalid: u64,
}

impl std::ops::Add for RouterStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            routed: self.routed + other.routed,
            filtered: self.filtered + other.filtered,
            rejected_invalid: self.rejected_invalid + other.rejected_invalid,
        }
    }
}

#[derive(Default)]
pub struct Route {
    name: String,
    transforms: Vec<Arc<dyn Transform>>,
    outputs: Vec<Output>,
    routed: AtomicU64,
    filtered: AtomicU64,
    rejected_invalid: AtomicU64,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field(
                "transforms",
                &self.transforms.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("outputs", &self.outputs.len())
            .finish_non_exhaustive()
    }
}

impl Route {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: Output) -> Self {
        self.outputs.push(output);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the transform chain and enqueues every surviving metric.
    pub fn route(&self, metric: Metric) {
        if !self.admit(&metric) {
            metric.reject();
            return;
        }

        let mut current = vec![metric];
        for transform in &self.transforms {
            current = current
                .into_iter()
                .flat_map(|m| transform.apply(m))
                .collect();
            if current.is_empty() {
                debug!(route = %self.name, transform = transform.name(), "Metric consumed by transform");
                return;
            }
        }

        for metric in current {
            if self.admit(&metric) {
                self.fan_out(metric);
            } else {
                metric.reject();
            }
        }
    }

    fn admit(&self, metric: &Metric) -> bool {
        match metric.validate() {
            Ok(()) => true,
            Err(e) => {
                self.rejected_invalid.fetch_add(1, Ordering::Relaxed);
                warn!(route = %self.name, "Rejecting invalid metric: {e}");
                false
            }
        }
    }

    fn fan_out(&self, metric: Metric) {
        let targets: Vec<&Output> = self.outputs.iter().filter(|o| o.accepts(&metric)).collect();
        let Some((last, rest)) = targets.split_last() else {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            metric.drop_metric();
            return;
        };

        for output in rest {
            output.buffer.add(metric.clone());
        }
        last.buffer.add(metric);
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            rejected_invalid: self.rejected_invalid.load(Ordering::Relaxed),
        }
    }
}

/// Maps producers to routes, falling back to a default route.
#[derive(Debug, Clone)]
pub struct Router {
    default: Arc<Route>,
    routes: HashMap<String, Arc<Route>>,
}

impl Router {
    #[must_use]
    pub fn new(default: Route) -> Self {
        Self {
            default: Arc::new(default),
            routes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_route(mut self, producer: impl Into<String>, route: Route) -> Self {
        self.routes.insert(producer.into(), Arc::new(route));
        self
    }

    #[must_use]
    pub fn route_for(&self, producer: &str) -> Arc<Route> {
        Arc::clone(self.routes.get(producer).unwrap_or(&self.default))
    }

    /// Entry point handed to a producer. Timestamps are rounded to `precision`.
    #[must_use]
    pub fn accumulator(&self, producer: &str, precision: Duration) -> Accumulator {
        Accumulator {
            producer: Arc::from(producer),
            route: self.route_for(producer),
            precision,
            tracker: None,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.routes
            .values()
            .fold(self.default.stats(), |acc, route| acc + route.stats())
    }
}

/// Producer-side handle into a route.
#[derive(Debug, Clone)]
pub struct Accumulator {
    producer: Arc<str>,
    route: Arc<Route>,
    precision: Duration,
    tracker: Option<Tracker>,
    errors: Arc<AtomicU64>,
}

impl Accumulator {
    /// Accumulator that routes straight into `route`, without rounding.
    #[must_use]
    pub fn for_route(producer: &str, route: Arc<Route>) -> Self {
        Self {
            producer: Arc::from(producer),
            route,
            precision: Duration::ZERO,
            tracker: None,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Tracks every metric added through [`Accumulator::add_tracked`].
    #[must_use]
    pub fn with_tracker(mut self, tracker: Tracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    #[must_use]
    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn add_metric(&self, mut metric: Metric) {
        metric.round_timestamp(self.precision);
        self.route.route(metric);
    }

    pub fn add_fields(&self, name: &str, tags: Tags, fields: Fields) {
        self.add_metric(Metric::create(name, tags, fields, now_nanos()));
    }

    /// Adds a metric through the accumulator's tracker, waiting for capacity when the
    /// tracker is bounded. Untracked when no tracker is configured.
    pub async fn add_tracked(&self, metric: Metric) -> Option<TrackingId> {
        match &self.tracker {
            Some(tracker) => {
                let (metric, id) = tracker.track_bounded(metric).await;
                self.add_metric(metric);
                Some(id)
            }
            None => {
                self.add_metric(metric);
                None
            }
        }
    }

    /// Reports a producer-side error. The pipeline keeps running.
    pub fn add_error(&self, err: impl Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        error!(producer = %self.producer, "Error in producer: {err}");
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
