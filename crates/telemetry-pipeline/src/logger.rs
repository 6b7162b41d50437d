// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the agent and for shim children.
//!
//! The host prints every event as
//!
//! ```text
//! AGENT | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! A shim child writes its logs to stderr, which doubles as the failure side channel
//! read by the host. Each line starts with a one-letter level marker:
//!
//! ```text
//! E! [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! [`classify_shim_line`] maps such a line back to a [`Level`] on the host side.

use std::fmt;
use tracing::Level;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::errors::ConfigError;

/// Targets that never log anything useful at `debug` and below.
const QUIET_TARGETS: &str = "mio=off,tokio_util=off";

/// Host formatter, prefixes every line with `AGENT | LEVEL |`.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "AGENT | {} | ", event.metadata().level())?;
        write_scope(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Shim child formatter, prefixes every line with `E! `, `W! `, `I! ` or `D! `.
#[derive(Debug, Clone, Copy)]
pub struct ShimFormatter;

impl<S, N> FormatEvent<S, N> for ShimFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{} ", shim_marker(*event.metadata().level()))?;
        write_scope(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Writes the active spans from root to leaf as `name{fields}: `.
fn write_scope<S, N>(ctx: &FmtContext<'_, S, N>, writer: &mut format::Writer<'_>) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };
    for span in scope.from_root() {
        write!(writer, "{}", span.name())?;
        let ext = span.extensions();
        if let Some(fields) = ext.get::<FormattedFields<N>>() {
            if !fields.is_empty() {
                write!(writer, "{{{fields}}}")?;
            }
        }
        write!(writer, ": ")?;
    }
    Ok(())
}

fn shim_marker(level: Level) -> &'static str {
    match level {
        Level::ERROR => "E!",
        Level::WARN => "W!",
        Level::INFO => "I!",
        _ => "D!",
    }
}

/// Splits a line read from a shim child's stderr into its level and message.
///
/// Lines without a marker are treated as errors: anything a child prints to stderr
/// outside its logger is most likely a crash report.
#[must_use]
pub fn classify_shim_line(line: &str) -> (Level, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    let level = match line.get(..3) {
        Some("E! ") => Level::ERROR,
        Some("W! ") => Level::WARN,
        Some("I! ") => Level::INFO,
        Some("D! ") => Level::DEBUG,
        _ => return (Level::ERROR, line),
    };
    (level, &line[3..])
}

fn env_filter(log_level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(format!("{QUIET_TARGETS},{log_level}")).map_err(|e| {
        ConfigError::InvalidConfig(format!("could not parse log level '{log_level}': {e}"))
    })
}

/// Installs the host subscriber as the global default.
pub fn init_host_logging(log_level: &str) -> Result<(), ConfigError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level)?)
        .event_format(Formatter)
        .try_init()
        .map_err(|e| ConfigError::InvalidConfig(format!("setting default subscriber failed: {e}")))
}

/// Installs the shim child subscriber, writing to stderr, as the global default.
pub fn init_shim_logging(log_level: &str) -> Result<(), ConfigError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level)?)
        .with_writer(std::io::stderr)
        .event_format(ShimFormatter)
        .try_init()
        .map_err(|e| ConfigError::InvalidConfig(format!("setting default subscriber failed: {e}")))
}
