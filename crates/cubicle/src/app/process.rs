//! Host processes for app components
//!
//! Every command runs through `sh -c` as the leader of a fresh process
//! group, so stopping it also stops whatever the dev server forked.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

use crate::app::readiness::strip_ansi;
use crate::session::LogBuffer;

/// Lines of combined output attached to install and crash errors
const TAIL_LINES: usize = 40;

/// Extra time given to the group leader after SIGKILL
const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Longest output line kept; the rest of the line is discarded
const MAX_LINE_BYTES: usize = 8 * 1024;

/// How long to keep reading output after a process exits
pub const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// How a process ended; `code` is `None` when a signal killed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub code: Option<i32>,
}

impl Exit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "killed by signal"),
        }
    }
}

/// One line of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: &'static str,
    pub text: String,
}

/// What to run and where
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Prefix of the log streams this process writes to
    pub label: String,
    pub command: String,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(label: impl Into<String>, command: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            dir: dir.into(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Log stream name for `stream` ("stdout" or "stderr")
    pub fn stream_name(&self, stream: &str) -> String {
        format!("{}:{stream}", self.label)
    }

    /// Last lines of both streams, stdout first
    pub fn tail(&self, logs: &LogBuffer) -> String {
        let mut lines = Vec::new();
        for stream in ["stdout", "stderr"] {
            let captured = logs.lines(&self.stream_name(stream));
            let skip = captured.len().saturating_sub(TAIL_LINES);
            lines.extend(captured.into_iter().skip(skip));
        }
        lines.join("\n")
    }
}

/// Waits for a process to exit; cheap to clone
#[derive(Debug, Clone)]
pub struct ExitWatch(watch::Receiver<Option<Exit>>);

impl ExitWatch {
    pub fn get(&self) -> Option<Exit> {
        *self.0.borrow()
    }

    pub async fn wait(&self) -> Exit {
        let mut rx = self.0.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(Exit { code: None }),
            Err(_) => Exit { code: None },
        }
    }
}

/// A spawned process group
#[derive(Debug)]
pub struct AppProcess {
    label: String,
    pgid: Option<u32>,
    exit: ExitWatch,
    lines: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

impl AppProcess {
    /// Start `spec`; output lines are appended to `logs` for the life of the process
    #[instrument(skip(logs), fields(label = %spec.label))]
    pub fn spawn(spec: &ProcessSpec, logs: Arc<LogBuffer>) -> std::io::Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let pgid = child.id();
        debug!(pgid, command = %spec.command, "process started");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, "stdout", spec.stream_name("stdout"), logs.clone(), line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, "stderr", spec.stream_name("stderr"), logs, line_tx);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let label = spec.label.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => Exit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(%label, error = %e, "failed to wait for process");
                    Exit { code: None }
                }
            };
            debug!(%label, %exit, "process exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            label: spec.label.clone(),
            pgid,
            exit: ExitWatch(exit_rx),
            lines: Some(line_rx),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take the live line feed; later lines still reach the log buffer
    pub fn take_lines(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.lines.take()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.get().is_some()
    }

    pub async fn wait(&self) -> Exit {
        self.exit.wait().await
    }

    /// SIGTERM the group, then SIGKILL it once `grace` runs out
    ///
    /// The group is signalled even when the leader is already gone, since
    /// its children may outlive it.
    #[instrument(skip(self), fields(label = %self.label))]
    pub async fn terminate(&self, grace: Duration) {
        let Some(pgid) = self.pgid else {
            return;
        };
        signal_group(pgid, "TERM").await;
        if tokio::time::timeout(grace, self.wait()).await.is_err() {
            debug!(pgid, "grace period elapsed");
        }
        signal_group(pgid, "KILL").await;
        if tokio::time::timeout(KILL_SETTLE, self.wait()).await.is_err() {
            warn!(pgid, "process group did not exit after SIGKILL");
        }
    }
}

fn forward_lines<R>(
    reader: R,
    stream: &'static str,
    stream_name: String,
    logs: Arc<LogBuffer>,
    tx: mpsc::UnboundedSender<OutputLine>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match read_line_capped(&mut reader, &mut line, MAX_LINE_BYTES).await {
                Ok(0) => break,
                Ok(_) => {
                    while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                        line.pop();
                    }
                    let text = strip_ansi(&String::from_utf8_lossy(&line)).into_owned();
                    logs.push(&stream_name, text.clone());
                    // The receiver goes away once readiness is settled.
                    let _ = tx.send(OutputLine { stream, text });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(stream = %stream_name, error = %e, "output stream closed");
                    break;
                }
            }
        }
    });
}

/// Read up to and including the next `\n`, keeping at most `cap` bytes in `line`
///
/// Returns the number of bytes consumed from `reader`, zero at end of stream.
/// Bytes are not decoded here, so output that is not UTF-8 never ends the read.
async fn read_line_capped<R>(reader: &mut R, line: &mut Vec<u8>, cap: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = cap.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);
        let used = chunk.len();
        reader.consume(used);
        consumed += used;
        if complete {
            return Ok(consumed);
        }
    }
}

async fn signal_group(pgid: u32, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if !status.success() => {
            debug!(pgid, signal, "process group already gone");
        }
        Ok(_) => debug!(pgid, signal, "process group signalled"),
        Err(e) => warn!(pgid, signal, error = %e, "failed to run kill"),
    }
}

/// Wait until both output streams close or `limit` elapses
///
/// Readers trail the exit of the process, so this settles the log buffer
/// before its tail is read.
pub async fn drain(mut lines: mpsc::UnboundedReceiver<OutputLine>, limit: Duration) {
    let _ = tokio::time::timeout(limit, async { while lines.recv().await.is_some() {} }).await;
}

/// Result of a command run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Exited(Exit),
    TimedOut,
}

/// Run `spec` until it exits or `timeout` elapses; a timed out group is killed
pub async fn run_to_completion(
    spec: &ProcessSpec,
    timeout: Duration,
    logs: Arc<LogBuffer>,
) -> std::io::Result<Completion> {
    let mut process = AppProcess::spawn(spec, logs)?;
    let lines = process.take_lines();
    match tokio::time::timeout(timeout, process.wait()).await {
        Ok(exit) => {
            if let Some(lines) = lines {
                drain(lines, OUTPUT_DRAIN).await;
            }
            Ok(Completion::Exited(exit))
        }
        Err(_) => {
            process.terminate(Duration::ZERO).await;
            Ok(Completion::TimedOut)
        }
    }
}
