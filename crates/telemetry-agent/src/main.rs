// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use telemetry_pipeline::{
    agent::AgentBuilder,
    config::AgentConfig,
    logger::init_host_logging,
    shim::{
        host::{GatherSignal, ShimCollector, ShimCommand, ShimSink},
        watch_for_shutdown, LineProtocolWriter,
    },
    transforms::DropUnencodable,
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("AGENT_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    if let Err(e) = init_host_logging(&log_level) {
        eprintln!("{e}");
        return;
    }
    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("Agent failed: {e:#}");
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AgentConfig::from_env().context("loading configuration")?;

    let signal = if config.exec_signal_stdin {
        GatherSignal::Stdin
    } else {
        GatherSignal::None
    };

    // Every sink here writes line protocol.
    let mut builder = AgentBuilder::new().transform(Arc::new(DropUnencodable));
    for (i, command_line) in config.exec_inputs.iter().enumerate() {
        let command = ShimCommand::parse(command_line)
            .with_context(|| format!("parsing AGENT_EXEC_INPUT entry {i}"))?;
        let name = format!("exec_{i}");
        debug!("Adding shim collector {name}: {command}");
        let collector = ShimCollector::new(name, command)
            .with_signal(signal)
            .with_grace(config.shutdown_grace);
        builder = builder.collector(
            Arc::new(collector),
            config.schedule_config(),
            config.precision,
        );
    }

    if let Some(command_line) = &config.exec_output {
        let command = ShimCommand::parse(command_line).context("parsing AGENT_EXEC_OUTPUT")?;
        debug!("Adding shim sink: {command}");
        let sink = ShimSink::new("exec_output", command).with_grace(config.shutdown_grace);
        builder = builder.sink(
            Arc::new(sink),
            config.flusher_config(),
            config.buffer_limit,
            None,
        );
    }

    if config.stdout_output {
        builder = builder.sink(
            Arc::new(LineProtocolWriter::new(tokio::io::stdout())),
            config.flusher_config(),
            config.buffer_limit,
            None,
        );
    }

    let shutdown = CancellationToken::new();
    watch_for_shutdown(shutdown.clone()).context("installing signal handlers")?;

    let handle = builder.build().start().await;
    info!(
        inputs = config.exec_inputs.len(),
        "Telemetry agent started"
    );

    shutdown.cancelled().await;
    let report = handle.stop().await;
    info!(
        "Shutdown report: {}",
        serde_json::to_string(&report).context("encoding shutdown report")?
    );
    Ok(())
}
