// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default per-sink buffer capacity, in metrics.
pub const DEFAULT_BUFFER_LIMIT: usize = 10_000;

/// Default number of metrics handed to a sink in one write.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound for a single sink write attempt.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long in-flight work may run after a shutdown signal before it is abandoned.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Shim children emit one record per write unless configured otherwise.
pub const DEFAULT_SHIM_BATCH_SIZE: usize = 1;
pub const DEFAULT_SHIM_BATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted on a shim stream. Longer lines are discarded up to the next newline.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Time a shim sink waits for a failure report on the child's stderr after each batch.
pub const DEFAULT_SHIM_ACK_WINDOW: Duration = Duration::from_millis(50);
