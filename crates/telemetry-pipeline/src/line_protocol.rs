// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited line protocol used on shim streams.
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] [timestamp_ns]
//! ```
//!
//! Commas, equal signs, spaces, backslashes and newlines inside names, tag keys, tag
//! values and field keys are backslash escaped. String field values are double quoted
//! with `"` and `\` escaped. Integers carry an `i` suffix and unsigned integers a `u`
//! suffix; bare numbers are floats.

use std::fmt::Write as _;

use crate::errors::{ParseError, SerializeError};
use crate::metric::{now_nanos, FieldValue, Fields, Metric, Tags};

/// Encodes one metric as a single record, trailing newline included.
pub fn serialize(metric: &Metric) -> Result<String, SerializeError> {
    let mut out = String::with_capacity(64);
    serialize_into(metric, &mut out)?;
    Ok(out)
}

/// Appends one record to `out`. On error `out` is left unchanged.
pub fn serialize_into(metric: &Metric, out: &mut String) -> Result<(), SerializeError> {
    if metric.fields().is_empty() {
        return Err(SerializeError::NoFields(metric.name.to_string()));
    }
    if let Some((field, _)) = metric
        .fields()
        .iter()
        .find(|(_, v)| matches!(v, FieldValue::Float(f) if !f.is_finite()))
    {
        return Err(SerializeError::NonFiniteFloat {
            metric: metric.name.to_string(),
            field: field.clone(),
        });
    }

    escape_into(out, metric.name.as_str(), &[',', ' ']);
    for (key, value) in metric.tags() {
        // Empty tag values cannot be represented.
        if key.is_empty() || value.is_empty() {
            continue;
        }
        out.push(',');
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        escape_into(out, value, &[',', '=', ' ']);
    }

    out.push(' ');
    for (i, (key, value)) in metric.fields().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        write_field_value(out, value);
    }

    let _ = writeln!(out, " {}", metric.timestamp);
    Ok(())
}

fn escape_into(out: &mut String, s: &str, specials: &[char]) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if specials.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

fn write_field_value(out: &mut String, value: &FieldValue) {
    match value {
        FieldValue::Int(v) => {
            let _ = write!(out, "{v}i");
        }
        FieldValue::Uint(v) => {
            let _ = write!(out, "{v}u");
        }
        FieldValue::Float(v) => {
            let _ = write!(out, "{v}");
        }
        FieldValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::String(v) => {
            out.push('"');
            escape_into(out, v, &['"']);
            out.push('"');
        }
    }
}

/// Decodes one record. A missing timestamp defaults to the current time.
pub fn parse(line: &str) -> Result<Metric, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let (head, rest) = split_once_unescaped(line, b' ', false)?.ok_or(ParseError::MissingFields)?;
    let (field_section, timestamp) = match split_once_unescaped(rest, b' ', true)? {
        Some((fields, ts)) => (fields, Some(ts.trim())),
        None => (rest, None),
    };

    let mut head_parts = split_unescaped(head, b',', false)?.into_iter();
    let name = unescape(head_parts.next().unwrap_or_default());
    if name.is_empty() {
        return Err(ParseError::MissingName);
    }

    let mut tags = Tags::new();
    for part in head_parts {
        let (key, value) = split_once_unescaped(part, b'=', false)?
            .ok_or_else(|| ParseError::InvalidTag(part.to_string()))?;
        if key.is_empty() || value.is_empty() {
            return Err(ParseError::InvalidTag(part.to_string()));
        }
        tags.insert(unescape(key), unescape(value));
    }

    if field_section.is_empty() {
        return Err(ParseError::MissingFields);
    }
    let mut fields = Fields::new();
    for part in split_unescaped(field_section, b',', true)? {
        let (key, raw) = split_once_unescaped(part, b'=', true)?
            .ok_or_else(|| ParseError::InvalidField(part.to_string()))?;
        if key.is_empty() || raw.is_empty() {
            return Err(ParseError::InvalidField(part.to_string()));
        }
        let key = unescape(key);
        let value = parse_field_value(&key, raw)?;
        fields.insert(key, value);
    }

    let timestamp = match timestamp {
        None | Some("") => now_nanos(),
        Some(ts) if ts.contains(char::is_whitespace) => {
            return Err(ParseError::TrailingData(ts.to_string()))
        }
        Some(ts) => ts
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidTimestamp(ts.to_string()))?,
    };

    Ok(Metric::create(&name, tags, fields, timestamp))
}

fn parse_field_value(field: &str, raw: &str) -> Result<FieldValue, ParseError> {
    let invalid = || ParseError::InvalidFieldValue {
        field: field.to_string(),
        value: raw.to_string(),
    };

    if let Some(quoted) = raw.strip_prefix('"') {
        let inner = quoted.strip_suffix('"').ok_or(ParseError::UnterminatedString)?;
        return Ok(FieldValue::String(unescape(inner)));
    }
    match raw {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Bool(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Bool(false)),
        _ => {}
    }
    if let Some(int) = raw.strip_suffix('i') {
        return int.parse::<i64>().map(FieldValue::Int).map_err(|_| invalid());
    }
    if let Some(uint) = raw.strip_suffix('u') {
        return uint.parse::<u64>().map(FieldValue::Uint).map_err(|_| invalid());
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(FieldValue::Float(v)),
        _ => Err(invalid()),
    }
}

/// Splits at every `sep` that is neither escaped nor (optionally) inside a quoted string.
fn split_unescaped(s: &str, sep: u8, quotes: bool) -> Result<Vec<&str>, ParseError> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some((part, tail)) = split_once_unescaped(rest, sep, quotes)? {
        parts.push(part);
        rest = tail;
    }
    parts.push(rest);
    Ok(parts)
}

fn split_once_unescaped(s: &str, sep: u8, quotes: bool) -> Result<Option<(&str, &str)>, ParseError> {
    // Every byte compared here is ASCII, so indices always fall on char boundaries.
    let bytes = s.as_bytes();
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'"' if quotes => in_quotes = !in_quotes,
            b if b == sep && !in_quotes => return Ok(Some((&s[..i], &s[i + 1..]))),
            _ => {}
        }
        i += 1;
    }
    if in_quotes {
        return Err(ParseError::UnterminatedString);
    }
    Ok(None)
}

fn unescape(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
