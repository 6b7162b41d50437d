// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by transforms and configuration.

use regex::Regex;

/// Validates a measurement-name prefix.
///
/// A usable prefix starts with an ASCII letter and contains only ASCII alphanumerics,
/// underscores, periods or dashes. Surrounding whitespace is ignored.
///
/// ```
/// use telemetry_pipeline::util::parse_name_prefix;
///
/// assert_eq!(parse_name_prefix("host_"), Some("host_".to_string()));
/// assert_eq!(parse_name_prefix(" app.metrics. "), Some("app.metrics.".to_string()));
/// assert_eq!(parse_name_prefix("1app"), None);
/// assert_eq!(parse_name_prefix("my app"), None);
/// ```
pub fn parse_name_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim();
    let mut chars = trimmed.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        Some(first) => {
            tracing::error!(
                "Name prefix must start with a letter, got '{first}' in '{trimmed}'. Ignoring prefix."
            );
            return None;
        }
        None => return None,
    }

    if let Some(invalid) =
        chars.find(|&ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '_' | '.' | '-'))
    {
        tracing::error!(
            "Name prefix contains invalid character '{invalid}' in '{trimmed}'. Ignoring prefix."
        );
        return None;
    }

    Some(trimmed.to_string())
}

/// Compiles a shell-style glob (`*` any run, `?` one character) into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}
