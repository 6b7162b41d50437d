// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Pipeline
//!
//! The metric-movement engine of a telemetry collection agent.
//!
//! ## Overview
//!
//! Metrics flow through the pipeline in one direction:
//!
//! ```text
//!   Scheduler ──> Collector ──> Accumulator ──> Route ──> Buffer(s) ──> Flusher ──> Sink
//!                                   │             │                        │
//!                                   │       Transform(s)                   │
//!                                   └──── tracking notification <──────────┘
//! ```
//!
//! - [`metric`] / [`tracking`]: the metric value and its delivery-tracking share
//! - [`buffer`]: bounded per-sink FIFO with drop-oldest eviction
//! - [`scheduler`]: periodic, non re-entrant unit scheduling with jitter and alignment
//! - [`router`]: accumulators, transform chains and fan-out to buffers
//! - [`flusher`]: batching, retry/backoff and serialized per-sink delivery
//! - [`shim`]: run a collector, transform or sink as a separate process over
//!   newline-delimited line protocol
//! - [`agent`]: shared lifecycle and ordered shutdown for all of the above

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod errors;
pub mod flusher;
pub mod line_protocol;
pub mod logger;
pub mod metric;
pub mod router;
pub mod scheduler;
pub mod shim;
pub mod tracking;
pub mod transforms;
pub mod util;
