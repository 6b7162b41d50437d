// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in transforms.

use tracing::{error, trace};

use crate::errors::ConfigError;
use crate::line_protocol::serialize;
use crate::metric::{Metric, Tags};
use crate::router::{MetricFilter, Transform};
use crate::util::parse_name_prefix;

/// Forwards metrics whose name passes the filter and drops the rest.
#[derive(Debug, Clone)]
pub struct NameFilter {
    filter: MetricFilter,
}

impl NameFilter {
    #[must_use]
    pub fn new(filter: MetricFilter) -> Self {
        Self { filter }
    }
}

impl Transform for NameFilter {
    fn name(&self) -> &str {
        "name_filter"
    }

    fn apply(&self, metric: Metric) -> Vec<Metric> {
        if self.filter.matches(&metric) {
            vec![metric]
        } else {
            trace!(metric = %metric.name, "Filtered out by name");
            metric.drop_metric();
            Vec::new()
        }
    }
}

/// Adds a fixed set of tags. Existing tags win unless `overwrite` is set.
#[derive(Debug, Clone)]
pub struct TagEnricher {
    tags: Tags,
    overwrite: bool,
}

impl TagEnricher {
    #[must_use]
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            overwrite: false,
        }
    }

    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl Transform for TagEnricher {
    fn name(&self) -> &str {
        "tag_enricher"
    }

    fn apply(&self, mut metric: Metric) -> Vec<Metric> {
        for (key, value) in &self.tags {
            if self.overwrite || metric.tag(key).is_none() {
                metric.add_tag(key.clone(), value.clone());
            }
        }
        vec![metric]
    }
}

#[derive(Debug, Clone)]
pub struct NamePrefix {
    prefix: String,
}

impl NamePrefix {
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        parse_name_prefix(prefix)
            .map(|prefix| Self { prefix })
            .ok_or_else(|| ConfigError::InvalidConfig(format!("invalid name prefix '{prefix}'")))
    }
}

impl Transform for NamePrefix {
    fn name(&self) -> &str {
        "name_prefix"
    }

    fn apply(&self, mut metric: Metric) -> Vec<Metric> {
        let name = format!("{}{}", self.prefix, metric.name);
        metric.set_name(&name);
        vec![metric]
    }
}

/// Drops metrics that cannot be written as line protocol, such as non-finite floats.
///
/// Line-protocol sinks skip such metrics while writing and would otherwise report
/// the whole batch, skipped metrics included, as delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropUnencodable;

impl Transform for DropUnencodable {
    fn name(&self) -> &str {
        "drop_unencodable"
    }

    fn apply(&self, metric: Metric) -> Vec<Metric> {
        match serialize(&metric) {
            Ok(_) => vec![metric],
            Err(e) => {
                error!("Dropping metric {}: {e}", metric.name);
                metric.drop_metric();
                Vec::new()
            }
        }
    }
}
