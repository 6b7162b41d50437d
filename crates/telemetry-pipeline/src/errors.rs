// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors raised while decoding a line-protocol record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing measurement name")]
    MissingName,
    #[error("missing field set")]
    MissingFields,
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("invalid field value for {field}: {value}")]
    InvalidFieldValue { field: String, value: String },
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("unterminated string value")]
    UnterminatedString,
    #[error("trailing data after timestamp: {0}")]
    TrailingData(String),
}

/// Errors raised while encoding a metric into line protocol.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SerializeError {
    #[error("metric {0} has no serializable fields")]
    NoFields(String),
    #[error("field {field} of {metric} is not a finite number")]
    NonFiniteFloat { metric: String, field: String },
}

/// A metric is structurally unusable and must not enter a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("metric name is empty")]
    EmptyName,
    #[error("metric {0} has no fields")]
    NoFields(String),
}

/// Outcome of a failed sink write.
///
/// Transient errors are retried according to the flusher's retry strategy, permanent
/// errors reject the batch immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),
    #[error("permanent sink failure: {0}")]
    Permanent(String),
    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),
}

impl SinkError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Errors reported by a collector run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectError {
    /// The run failed, the unit keeps its schedule.
    #[error("collection failed: {0}")]
    Failed(String),
    /// The unit can no longer produce metrics and must not be scheduled again.
    #[error("collector is unhealthy: {0}")]
    Fatal(String),
}

/// Result of a flush that could not deliver its batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("sink {sink} rejected {count} metrics after {attempts} attempts: {reason}")]
    Rejected {
        sink: String,
        count: usize,
        attempts: u64,
        reason: SinkError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("nothing to run")]
    NothingToRun,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process is missing its {0} stream")]
    MissingStream(&'static str),
    #[error("failed to read input: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write output: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
    #[error("failed to start collector: {0}")]
    Collect(#[from] CollectError),
}
