// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_LIMIT, DEFAULT_COLLECTION_INTERVAL,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_SHUTDOWN_GRACE, DEFAULT_WRITE_TIMEOUT,
};
use crate::errors::ConfigError;
use crate::flusher::{FlusherConfig, RetryStrategy};
use crate::router::MetricFilter;
use crate::scheduler::{OverrunPolicy, ScheduleConfig};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Agent-wide settings, loaded from `AGENT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Default collection interval. Zero disables timer driven collection.
    pub interval: Duration,
    pub jitter: Duration,
    /// Timestamp precision applied by accumulators.
    pub precision: Duration,
    /// Align collection to wall-clock multiples of the interval.
    pub round_interval: bool,
    pub flush_interval: Duration,
    pub flush_jitter: Duration,
    pub batch_size: usize,
    pub buffer_limit: usize,
    pub write_timeout: Duration,
    pub retry_attempts: u64,
    pub shutdown_grace: Duration,
    /// Command lines of shim collectors, one child per entry.
    pub exec_inputs: Vec<String>,
    /// Command line of a shim sink.
    pub exec_output: Option<String>,
    /// Prompt shim collectors with a newline on every gather.
    pub exec_signal_stdin: bool,
    /// Also write everything as line protocol to stdout.
    pub stdout_output: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            interval: DEFAULT_COLLECTION_INTERVAL,
            jitter: Duration::ZERO,
            precision: Duration::ZERO,
            round_interval: true,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_jitter: Duration::ZERO,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            exec_inputs: Vec::new(),
            exec_output: None,
            exec_signal_stdin: false,
            stdout_output: true,
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unset or unparsable values fall back
    /// to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map_or(default, Duration::from_millis)
        };
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|val| val.trim().parse::<usize>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|val| val.trim().to_lowercase() != "false")
                .unwrap_or(default)
        };

        let exec_signal_stdin = match lookup("AGENT_EXEC_SIGNAL") {
            None => false,
            Some(signal) => match signal.trim().to_lowercase().as_str() {
                "" | "none" => false,
                "stdin" => true,
                other => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "Invalid exec signal '{other}'. Must be one of: none, stdin"
                    )))
                }
            },
        };

        let config = Self {
            log_level: lookup("AGENT_LOG_LEVEL")
                .map(|val| val.trim().to_lowercase())
                .unwrap_or(defaults.log_level),
            interval: millis("AGENT_INTERVAL_MS", defaults.interval),
            jitter: millis("AGENT_JITTER_MS", defaults.jitter),
            precision: millis("AGENT_PRECISION_MS", defaults.precision),
            round_interval: flag("AGENT_ROUND_INTERVAL", defaults.round_interval),
            flush_interval: millis("AGENT_FLUSH_INTERVAL_MS", defaults.flush_interval),
            flush_jitter: millis("AGENT_FLUSH_JITTER_MS", defaults.flush_jitter),
            batch_size: number("AGENT_BATCH_SIZE", defaults.batch_size),
            buffer_limit: number("AGENT_BUFFER_LIMIT", defaults.buffer_limit),
            write_timeout: millis("AGENT_WRITE_TIMEOUT_MS", defaults.write_timeout),
            retry_attempts: lookup("AGENT_RETRY_ATTEMPTS")
                .and_then(|val| val.trim().parse::<u64>().ok())
                .unwrap_or(defaults.retry_attempts),
            shutdown_grace: millis("AGENT_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            exec_inputs: lookup("AGENT_EXEC_INPUT")
                .map(|val| {
                    val.split(';')
                        .map(str::trim)
                        .filter(|cmd| !cmd.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            exec_output: lookup("AGENT_EXEC_OUTPUT")
                .map(|val| val.trim().to_string())
                .filter(|cmd| !cmd.is_empty()),
            exec_signal_stdin,
            stdout_output: flag("AGENT_STDOUT_OUTPUT", defaults.stdout_output),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }
        if self.buffer_limit < self.batch_size {
            return Err(ConfigError::InvalidConfig(format!(
                "Buffer limit ({}) must be at least the batch size ({})",
                self.buffer_limit, self.batch_size
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Flush interval must be greater than 0".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Write timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Schedule applied to collectors that do not override it.
    #[must_use]
    pub fn schedule_config(&self) -> ScheduleConfig {
        let interval = (!self.interval.is_zero()).then_some(self.interval);
        ScheduleConfig {
            interval,
            jitter: self.jitter,
            align: self.round_interval,
            overrun: OverrunPolicy::Skip,
            run_timeout: interval.unwrap_or(DEFAULT_COLLECTION_INTERVAL),
            shutdown_grace: self.shutdown_grace,
        }
    }

    #[must_use]
    pub fn flusher_config(&self) -> FlusherConfig {
        FlusherConfig {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            flush_jitter: self.flush_jitter,
            retry_strategy: RetryStrategy::ExponentialBackoff {
                attempts: self.retry_attempts,
                base_ms: DEFAULT_RETRY_BASE_DELAY_MS,
                max_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            },
            write_timeout: self.write_timeout,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Optional durations expressed as integer milliseconds in configuration documents.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Per-collector settings, embeddable in an external configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    pub name: String,
    /// Overrides the agent interval. Zero disables timer driven collection.
    #[serde(rename = "interval_ms", deserialize_with = "duration_ms::deserialize")]
    pub interval: Option<Duration>,
    #[serde(rename = "jitter_ms", deserialize_with = "duration_ms::deserialize")]
    pub jitter: Option<Duration>,
    #[serde(rename = "precision_ms", deserialize_with = "duration_ms::deserialize")]
    pub precision: Option<Duration>,
    pub align: Option<bool>,
    pub overrun: OverrunPolicy,
    #[serde(rename = "timeout_ms", deserialize_with = "duration_ms::deserialize")]
    pub timeout: Option<Duration>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            interval: None,
            jitter: None,
            precision: None,
            align: None,
            overrun: OverrunPolicy::Skip,
            timeout: None,
        }
    }
}

impl InputConfig {
    #[must_use]
    pub fn schedule_config(&self, agent: &AgentConfig) -> ScheduleConfig {
        let base = agent.schedule_config();
        let interval = match self.interval {
            Some(interval) if interval.is_zero() => None,
            Some(interval) => Some(interval),
            None => base.interval,
        };
        ScheduleConfig {
            interval,
            jitter: self.jitter.unwrap_or(base.jitter),
            align: self.align.unwrap_or(base.align),
            overrun: self.overrun,
            run_timeout: self
                .timeout
                .or(interval)
                .unwrap_or(base.run_timeout),
            shutdown_grace: base.shutdown_grace,
        }
    }

    #[must_use]
    pub fn precision(&self, agent: &AgentConfig) -> Duration {
        self.precision.unwrap_or(agent.precision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryConfig {
    Immediate {
        attempts: u64,
    },
    Linear {
        attempts: u64,
        delay_ms: u64,
    },
    Exponential {
        attempts: u64,
        base_ms: u64,
        max_ms: u64,
    },
}

impl From<&RetryConfig> for RetryStrategy {
    fn from(config: &RetryConfig) -> Self {
        match *config {
            RetryConfig::Immediate { attempts } => Self::Immediate(attempts),
            RetryConfig::Linear { attempts, delay_ms } => Self::LinearBackoff(attempts, delay_ms),
            RetryConfig::Exponential {
                attempts,
                base_ms,
                max_ms,
            } => Self::ExponentialBackoff {
                attempts,
                base_ms,
                max_ms,
            },
        }
    }
}

/// Per-sink settings, embeddable in an external configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub name: String,
    pub batch_size: Option<usize>,
    pub buffer_limit: Option<usize>,
    #[serde(rename = "flush_interval_ms", deserialize_with = "duration_ms::deserialize")]
    pub flush_interval: Option<Duration>,
    #[serde(rename = "flush_jitter_ms", deserialize_with = "duration_ms::deserialize")]
    pub flush_jitter: Option<Duration>,
    #[serde(rename = "write_timeout_ms", deserialize_with = "duration_ms::deserialize")]
    pub write_timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
    pub namepass: Vec<String>,
    pub namedrop: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            batch_size: None,
            buffer_limit: None,
            flush_interval: None,
            flush_jitter: None,
            write_timeout: None,
            retry: None,
            namepass: Vec::new(),
            namedrop: Vec::new(),
        }
    }
}

impl OutputConfig {
    #[must_use]
    pub fn buffer_limit(&self, agent: &AgentConfig) -> usize {
        self.buffer_limit.unwrap_or(agent.buffer_limit)
    }

    pub fn flusher_config(&self, agent: &AgentConfig) -> Result<FlusherConfig, ConfigError> {
        let base = agent.flusher_config();
        let config = FlusherConfig {
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            flush_interval: self.flush_interval.unwrap_or(base.flush_interval),
            flush_jitter: self.flush_jitter.unwrap_or(base.flush_jitter),
            retry_strategy: self
                .retry
                .as_ref()
                .map_or(base.retry_strategy, RetryStrategy::from),
            write_timeout: self.write_timeout.unwrap_or(base.write_timeout),
            shutdown_grace: base.shutdown_grace,
        };
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "Output {}: batch size must be greater than 0",
                self.name
            )));
        }
        if config.flush_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(format!(
                "Output {}: flush interval must be greater than 0",
                self.name
            )));
        }
        Ok(config)
    }

    /// Name filter for this output, if any pattern is configured.
    pub fn filter(&self) -> Result<Option<MetricFilter>, ConfigError> {
        if self.namepass.is_empty() && self.namedrop.is_empty() {
            return Ok(None);
        }
        MetricFilter::new(self.namepass.as_slice(), self.namedrop.as_slice()).map(Some)
    }
}
