// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host side of the shim protocol: a shim child seen as a collector or as a sink.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn, Level};

use crate::agent::Collector;
use crate::constants::{DEFAULT_SHIM_ACK_WINDOW, DEFAULT_SHUTDOWN_GRACE, MAX_LINE_LENGTH};
use crate::errors::{CollectError, ConfigError, ShimError, SinkError};
use crate::flusher::Sink;
use crate::line_protocol::{parse, serialize_into};
use crate::logger::classify_shim_line;
use crate::metric::Metric;
use crate::router::Accumulator;

/// Program, arguments and extra environment of a shim child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ShimCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Splits a command line into program and arguments.
    ///
    /// Words are separated by whitespace. Single quotes keep their content verbatim,
    /// double quotes allow `\` escapes, and a `\` outside quotes escapes the next
    /// character.
    pub fn parse(command_line: &str) -> Result<Self, ConfigError> {
        let mut words = split_command_line(command_line)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| ConfigError::InvalidConfig("empty shim command".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
            env: Vec::new(),
        })
    }

    fn spawn(&self, stdout: Stdio) -> Result<Child, ShimError> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShimError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

impl fmt::Display for ShimCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn split_command_line(line: &str) -> Result<Vec<String>, ConfigError> {
    let dangling = || ConfigError::InvalidConfig(format!("dangling escape in '{line}'"));
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => current.push(chars.next().ok_or_else(dangling)?),
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                current.push(chars.next().ok_or_else(dangling)?);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ConfigError::InvalidConfig(format!(
            "unterminated quote in '{line}'"
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Re-logs a child's stderr at the level of each line's marker and counts error lines.
async fn relay_stderr(shim: String, stderr: ChildStderr, errors: watch::Sender<u64>) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let (level, message) = classify_shim_line(&line);
                match level {
                    Level::ERROR => {
                        error!(shim = %shim, "{message}");
                        errors.send_modify(|n| *n += 1);
                    }
                    Level::WARN => warn!(shim = %shim, "{message}"),
                    Level::INFO => info!(shim = %shim, "{message}"),
                    _ => debug!(shim = %shim, "{message}"),
                }
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(shim = %shim, "Skipping stderr line longer than {MAX_LINE_LENGTH} bytes");
            }
            Err(LinesCodecError::Io(e)) => {
                warn!(shim = %shim, "Failed to read stderr: {e}");
                break;
            }
        }
    }
}

/// Feeds every line the child writes to stdout into `acc` until end-of-stream.
async fn read_metrics<R>(shim: &str, stdout: R, acc: &Accumulator) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => match parse(&line) {
                Ok(metric) => acc.add_metric(metric),
                Err(e) => acc.add_error(format!("shim {shim} sent a malformed line: {e}")),
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => acc.add_error(format!(
                "shim {shim} sent a line longer than {MAX_LINE_LENGTH} bytes"
            )),
            Err(LinesCodecError::Io(e)) => return Err(e),
        }
    }
    Ok(())
}

fn spawn_reader<R>(shim: String, stdout: R, acc: Accumulator, healthy: Arc<AtomicBool>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match read_metrics(&shim, stdout, &acc).await {
            Ok(()) => debug!(shim = %shim, "Shim output closed"),
            Err(e) => error!(shim = %shim, "Failed to read shim output: {e}"),
        }
        healthy.store(false, Ordering::Relaxed);
    })
}

async fn write_and_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

/// Waits up to `grace` for the child to exit, then kills it.
async fn reap(shim: &str, child: &mut Child, grace: Duration) {
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(shim, "Shim exited with {status}"),
        Ok(Err(e)) => warn!(shim, "Failed to wait for shim: {e}"),
        Err(_) => {
            warn!(shim, "Shim still running after {grace:?}, killing it");
            if let Err(e) = child.kill().await {
                warn!(shim, "Failed to kill shim: {e}");
            }
        }
    }
}

/// How a [`ShimCollector`] asks its child for a gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatherSignal {
    /// The child produces on its own schedule.
    #[default]
    None,
    /// Write a newline to the child's stdin on every gather.
    Stdin,
}

struct CollectorProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// Runs a shim child as a service collector.
///
/// Whatever the child writes to stdout enters the pipeline through the accumulator
/// handed to [`Collector::start`]. Once the child's output ends the collector is
/// unhealthy and every gather fails fatally, which stops its unit.
pub struct ShimCollector {
    name: String,
    command: ShimCommand,
    signal: GatherSignal,
    grace: Duration,
    process: Mutex<Option<CollectorProcess>>,
    healthy: Arc<AtomicBool>,
}

impl ShimCollector {
    #[must_use]
    pub fn new(name: impl Into<String>, command: ShimCommand) -> Self {
        Self {
            name: name.into(),
            command,
            signal: GatherSignal::None,
            grace: DEFAULT_SHUTDOWN_GRACE,
            process: Mutex::new(None),
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_signal(mut self, signal: GatherSignal) -> Self {
        self.signal = signal;
        self
    }

    /// How long `stop` waits for the child's output to end before killing it.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait]
impl Collector for ShimCollector {
    fn name(&self) -> &str {
        &self.name
    }

    /// False until started and again once the child's output has ended.
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn start(&self, acc: Accumulator) -> Result<(), CollectError> {
        let mut child = self
            .command
            .spawn(Stdio::piped())
            .map_err(|e| CollectError::Fatal(e.to_string()))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(CollectError::Fatal(
                ShimError::MissingStream("stdout or stderr").to_string(),
            ));
        };

        self.healthy.store(true, Ordering::Relaxed);
        let (errors, _) = watch::channel(0);
        let stderr_task = tokio::spawn(relay_stderr(self.name.clone(), stderr, errors));
        let stdout_task = spawn_reader(self.name.clone(), stdout, acc, Arc::clone(&self.healthy));
        info!(shim = %self.name, pid = child.id(), "Started shim collector: {}", self.command);

        *self.process.lock().await = Some(CollectorProcess {
            stdin: child.stdin.take(),
            child,
            stdout_task,
            stderr_task,
        });
        Ok(())
    }

    async fn gather(&self, _acc: &Accumulator) -> Result<(), CollectError> {
        if !self.is_healthy() {
            return Err(CollectError::Fatal(format!(
                "shim {} is not running",
                self.name
            )));
        }
        if self.signal == GatherSignal::None {
            return Ok(());
        }

        let mut process = self.process.lock().await;
        let Some(stdin) = process.as_mut().and_then(|p| p.stdin.as_mut()) else {
            return Err(CollectError::Fatal(format!(
                "shim {} has no stdin",
                self.name
            )));
        };
        if let Err(e) = write_and_flush(stdin, b"\n").await {
            self.healthy.store(false, Ordering::Relaxed);
            return Err(CollectError::Fatal(format!(
                "failed to prompt shim {}: {e}",
                self.name
            )));
        }
        Ok(())
    }

    /// Closes the child's stdin and waits for its output to end.
    async fn stop(&self) {
        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };
        drop(process.stdin.take());

        if timeout(self.grace, &mut process.stdout_task).await.is_err() {
            warn!(
                shim = %self.name,
                "Shim output still open after {:?}, killing it", self.grace
            );
            process.stdout_task.abort();
            if let Err(e) = process.child.start_kill() {
                warn!(shim = %self.name, "Failed to kill shim: {e}");
            }
        }
        reap(&self.name, &mut process.child, self.grace).await;
        if timeout(self.grace, &mut process.stderr_task).await.is_err() {
            process.stderr_task.abort();
        }
        self.healthy.store(false, Ordering::Relaxed);
    }
}

struct SinkProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    errors: watch::Receiver<u64>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: JoinHandle<()>,
}

/// Runs a shim child as a sink.
///
/// A batch counts as written when no `E!` line shows up on the child's stderr within
/// the ack window. An error line makes the write fail as transient, so the flusher
/// retries it; a child that is gone fails permanently.
///
/// Error lines are counted, not matched to batches: an `E!` line the child prints after
/// the ack window has passed fails the next write instead of the one it refers to. The
/// line itself is still logged with the shim's name when it arrives.
///
/// Metrics that cannot be serialized are skipped while writing, and the rest of the
/// batch still counts as delivered. Put [`crate::transforms::DropUnencodable`] on the
/// route feeding this sink so they are dropped with a proper disposition.
pub struct ShimSink {
    name: String,
    command: ShimCommand,
    ack_window: Duration,
    grace: Duration,
    output: Option<Accumulator>,
    process: Mutex<Option<SinkProcess>>,
    healthy: AtomicBool,
}

impl ShimSink {
    #[must_use]
    pub fn new(name: impl Into<String>, command: ShimCommand) -> Self {
        Self {
            name: name.into(),
            command,
            ack_window: DEFAULT_SHIM_ACK_WINDOW,
            grace: DEFAULT_SHUTDOWN_GRACE,
            output: None,
            process: Mutex::new(None),
            healthy: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_ack_window(mut self, ack_window: Duration) -> Self {
        self.ack_window = ack_window;
        self
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Streams the child's stdout back into the pipeline, turning the sink into a
    /// processor.
    #[must_use]
    pub fn with_output(mut self, acc: Accumulator) -> Self {
        self.output = Some(acc);
        self
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn gone(&self) -> SinkError {
        self.healthy.store(false, Ordering::Relaxed);
        SinkError::Permanent(format!("shim {} is not running", self.name))
    }
}

#[async_trait]
impl Sink for ShimSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), SinkError> {
        let stdout = if self.output.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = self
            .command
            .spawn(stdout)
            .map_err(|e| SinkError::Permanent(e.to_string()))?;
        let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
            return Err(SinkError::Permanent(
                ShimError::MissingStream("stdin or stderr").to_string(),
            ));
        };

        self.healthy.store(true, Ordering::Relaxed);
        let (errors_tx, errors) = watch::channel(0);
        let stderr_task = tokio::spawn(relay_stderr(self.name.clone(), stderr, errors_tx));
        // The reader's health flag is unused: a processor's output ending is noticed
        // through stderr closing.
        let stdout_task = match (&self.output, child.stdout.take()) {
            (Some(acc), Some(stdout)) => Some(spawn_reader(
                self.name.clone(),
                stdout,
                acc.clone(),
                Arc::new(AtomicBool::new(true)),
            )),
            _ => None,
        };
        info!(shim = %self.name, pid = child.id(), "Started shim sink: {}", self.command);

        *self.process.lock().await = Some(SinkProcess {
            child,
            stdin: Some(stdin),
            errors,
            stdout_task,
            stderr_task,
        });
        Ok(())
    }

    async fn write(&self, metrics: &[Metric]) -> Result<(), SinkError> {
        let mut guard = self.process.lock().await;
        let Some(process) = guard.as_mut().filter(|_| self.is_healthy()) else {
            return Err(self.gone());
        };
        let Some(stdin) = process.stdin.as_mut() else {
            return Err(self.gone());
        };

        let mut out = String::new();
        for metric in metrics {
            if let Err(e) = serialize_into(metric, &mut out) {
                error!(shim = %self.name, "Skipping metric {}: {e}", metric.name);
            }
        }

        // Only errors reported after this write count against it.
        drop(process.errors.borrow_and_update());
        if let Err(e) = write_and_flush(stdin, out.as_bytes()).await {
            if e.kind() == io::ErrorKind::BrokenPipe {
                error!(shim = %self.name, "Shim closed its input");
                return Err(self.gone());
            }
            return Err(SinkError::Transient(e.to_string()));
        }

        match timeout(self.ack_window, process.errors.changed()).await {
            Err(_) => Ok(()),
            Ok(Ok(())) => Err(SinkError::Transient(format!(
                "shim {} reported a write failure",
                self.name
            ))),
            Ok(Err(_)) => Err(self.gone()),
        }
    }

    /// Closes the child's stdin and drains its output streams to end-of-stream.
    async fn close(&self) -> Result<(), SinkError> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        drop(process.stdin.take());

        let drained = timeout(self.grace, async {
            if let Some(task) = process.stdout_task.as_mut() {
                let _ = task.await;
            }
            let _ = (&mut process.stderr_task).await;
        })
        .await;
        if drained.is_err() {
            warn!(shim = %self.name, "Shim output still open after {:?}", self.grace);
            if let Some(task) = &process.stdout_task {
                task.abort();
            }
            process.stderr_task.abort();
        }
        reap(&self.name, &mut process.child, self.grace).await;
        self.healthy.store(false, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let command = ShimCommand::parse("/usr/bin/plugin --config '/etc/my conf.toml' -v")
            .expect("valid command");
        assert_eq!(command.program, "/usr/bin/plugin");
        assert_eq!(command.args, vec!["--config", "/etc/my conf.toml", "-v"]);
    }

    #[test]
    fn test_parse_command_escapes() {
        let command =
            ShimCommand::parse(r#"sh -c "echo \"hi\"" a\ b ''"#).expect("valid command");
        assert_eq!(command.program, "sh");
        assert_eq!(command.args, vec!["-c", r#"echo "hi""#, "a b", ""]);
    }

    #[test]
    fn test_parse_command_errors() {
        assert_eq!(
            ShimCommand::parse("   "),
            Err(ConfigError::InvalidConfig("empty shim command".to_string()))
        );
        assert!(ShimCommand::parse("plugin 'unterminated").is_err());
        assert!(ShimCommand::parse("plugin trailing\\").is_err());
    }

    #[test]
    fn test_display() {
        let command = ShimCommand::new("plugin").arg("-v").env("LEVEL", "debug");
        assert_eq!(command.to_string(), "plugin -v");
        assert_eq!(command.env, vec![("LEVEL".to_string(), "debug".to_string())]);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let collector = ShimCollector::new(
            "missing",
            ShimCommand::new("/nonexistent/shim-binary-for-tests"),
        );
        let route = Arc::new(crate::router::Route::new("test"));
        let err = collector
            .start(Accumulator::for_route("missing", route))
            .await
            .expect_err("cannot spawn");
        assert!(matches!(err, CollectError::Fatal(msg) if msg.contains("failed to spawn")));
        assert!(!collector.is_healthy());
    }

    #[tokio::test]
    async fn test_write_before_connect_is_permanent() {
        let sink = ShimSink::new("idle", ShimCommand::new("cat"));
        let err = sink
            .write(&[Metric::new("cpu").with_field("v", 1_i64)])
            .await
            .expect_err("not connected");
        assert!(err.is_permanent());
    }
}
