// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ustr::Ustr;

use crate::errors::ValidationError;
use crate::tracking::{Disposition, TrackingId, TrackingShare};

/// Tag key to tag value. Ordered so serialization is deterministic.
pub type Tags = BTreeMap<String, String>;

/// Field name to typed value.
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    /// Numeric view of the value, `None` for strings.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Uint(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::String(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// One named, timestamped observation.
///
/// Cloning a tracked metric forks its tracking share, so the clone is an independent
/// delivery path of the same handle. Use [`Metric::detach`] or
/// [`Metric::clone_untracked`] for copies that should not count as deliveries.
#[derive(Debug)]
pub struct Metric {
    pub name: Ustr,
    tags: Tags,
    fields: Fields,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    tracking: Option<TrackingShare>,
}

impl Metric {
    /// Creates a metric stamped with the current time.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::create(name, Tags::new(), Fields::new(), now_nanos())
    }

    #[must_use]
    pub fn create(name: &str, tags: Tags, fields: Fields, timestamp: i64) -> Self {
        Self {
            name: Ustr::from(name),
            tags,
            fields,
            timestamp,
            tracking: None,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_tag(key, value);
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.add_field(key, value);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Ustr::from(name);
    }

    #[must_use]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        self.tags.remove(key)
    }

    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    /// A metric must have a name and at least one field before it may enter a buffer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.fields.is_empty() {
            return Err(ValidationError::NoFields(self.name.to_string()));
        }
        Ok(())
    }

    /// Rounds the timestamp to the nearest multiple of `precision`. A zero precision keeps
    /// full nanosecond resolution.
    pub fn round_timestamp(&mut self, precision: Duration) {
        let Ok(step) = i64::try_from(precision.as_nanos()) else {
            return;
        };
        if step <= 1 {
            return;
        }
        let rem = self.timestamp.rem_euclid(step);
        let floor = self.timestamp - rem;
        self.timestamp = if rem * 2 >= step {
            floor.saturating_add(step)
        } else {
            floor
        };
    }

    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.tracking.is_some()
    }

    #[must_use]
    pub fn tracking_id(&self) -> Option<TrackingId> {
        self.tracking.as_ref().map(TrackingShare::id)
    }

    /// Marks this path as delivered.
    pub fn accept(self) {
        self.settle(Disposition::Accept);
    }

    /// Marks this path as failed: the data was lost.
    pub fn reject(self) {
        self.settle(Disposition::Reject);
    }

    /// Marks this path as intentionally discarded.
    pub fn drop_metric(self) {
        self.settle(Disposition::Drop);
    }

    pub fn settle(mut self, disposition: Disposition) {
        if let Some(share) = self.tracking.take() {
            share.settle(disposition);
        }
    }

    /// Settles this path as dropped and returns the same data untracked.
    #[must_use]
    pub fn detach(mut self) -> Self {
        if let Some(share) = self.tracking.take() {
            share.settle(Disposition::Drop);
        }
        self
    }

    /// Copy of the data that carries no tracking share.
    #[must_use]
    pub fn clone_untracked(&self) -> Self {
        Self {
            name: self.name,
            tags: self.tags.clone(),
            fields: self.fields.clone(),
            timestamp: self.timestamp,
            tracking: None,
        }
    }

    pub(crate) fn with_tracking(mut self, share: TrackingShare) -> Self {
        self.tracking = Some(share);
        self
    }
}

impl Clone for Metric {
    fn clone(&self) -> Self {
        Self {
            tracking: self.tracking.as_ref().map(TrackingShare::fork),
            ..self.clone_untracked()
        }
    }
}

/// Equality compares the data only, never the tracking state.
impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.timestamp == other.timestamp
            && self.tags == other.tags
            && self.fields == other.fields
    }
}
