//! Child-process [`WorkerSpawner`].
//!
//! Each worker is a separate OS process (by default the host executable
//! re-invoked with `--external-task-worker`). Control messages are written to
//! its stdin as JSON lines; events are read from its stdout. The child's
//! stderr is inherited so its logs land next to the host's.
//!
//! Per child, three tasks run:
//! - a stdin writer draining an ordered queue,
//! - a stdout reader forwarding [`WorkerEvent`]s to the observer,
//! - an exit waiter that reports the exit code and enforces the grace period
//!   after a terminate request.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use taskhost_core::supervisor::{ProcessObserver, SpawnRequest, WorkerProcess, WorkerSpawner};
use taskhost_types::config::{ENGINE_URL_ENV, WorkerSettings};
use taskhost_types::error::IpcError;
use taskhost_types::message::{WorkerEvent, WorkerMessage, decode_line, encode_line};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Spawns worker processes from a fixed command line.
#[derive(Debug, Clone)]
pub struct ChildProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    engine_url: String,
    grace: Duration,
}

impl ChildProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, engine_url: impl Into<String>, grace: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            engine_url: engine_url.into(),
            grace,
        }
    }

    /// Spawner for the configured worker command, defaulting to the current
    /// executable.
    pub fn from_settings(settings: &WorkerSettings, engine_url: &str) -> anyhow::Result<Self> {
        let program = match &settings.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().context("failed to resolve the current executable")?,
        };
        Ok(Self::new(
            program,
            settings.args.clone(),
            engine_url,
            Duration::from_millis(settings.shutdown_grace_ms),
        ))
    }
}

impl WorkerSpawner for ChildProcessSpawner {
    type Process = ChildProcess;

    fn spawn(&self, request: SpawnRequest, observer: ProcessObserver) -> anyhow::Result<ChildProcess> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env(ENGINE_URL_ENV, &self.engine_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn worker {} for topic '{}'",
                    self.program.display(),
                    request.topic
                )
            })?;

        let pid = child.id();
        let stdin = child.stdin.take().context("worker stdin was not captured")?;
        let stdout = child.stdout.take().context("worker stdout was not captured")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let terminate = CancellationToken::new();

        tokio::spawn(write_messages(stdin, rx, pid));
        tokio::spawn(read_events(stdout, observer.clone()));
        tokio::spawn(wait_for_exit(child, observer, terminate.clone(), self.grace));

        tracing::debug!(pid = ?pid, topic = %request.topic, directory = %request.directory.display(), "worker process spawned");
        Ok(ChildProcess {
            pid,
            queue: Mutex::new(Some(tx)),
            terminate,
        })
    }
}

/// Handle to a spawned worker process.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    /// Lines waiting for the stdin writer. `None` once IPC is disconnected.
    queue: Mutex<Option<mpsc::UnboundedSender<String>>>,
    terminate: CancellationToken,
}

impl WorkerProcess for ChildProcess {
    fn send(&self, message: &WorkerMessage) -> Result<(), IpcError> {
        let line = encode_line(message)?;
        let guard = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = guard.as_ref().ok_or(IpcError::Closed)?;
        queue.send(line).map_err(|_| IpcError::Closed)
    }

    fn terminate(&self) {
        // Dropping the sender ends the writer, which closes stdin.
        let queue = match self.queue.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(queue);
        self.terminate.cancel();
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn write_messages(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>, pid: Option<u32>) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(pid = ?pid, error = %e, "failed to write to worker stdin");
            break;
        }
    }
    // stdin is dropped here: the worker sees EOF and shuts down.
}

async fn read_events(stdout: ChildStdout, observer: ProcessObserver) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match decode_line::<WorkerEvent>(&line) {
                Ok(event) => observer.event(event),
                Err(_) => tracing::debug!(
                    directory = %observer.directory().display(),
                    line = %line,
                    "ignoring non-protocol output from worker"
                ),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "worker stdout closed");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: tokio::process::Child,
    observer: ProcessObserver,
    terminate: CancellationToken,
    grace: Duration,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = terminate.cancelled() => {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(pid = ?pid, grace_ms = grace.as_millis() as u64, "worker did not exit after disconnect, killing it");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(pid = ?pid, error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "failed to wait for worker");
            None
        }
    };
    tracing::debug!(pid = ?pid, ?code, "worker process exited");
    observer.exited(code);
}
