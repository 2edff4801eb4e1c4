//! Worker supervisor.
//!
//! One actor task owns every piece of supervisor state: the entry per
//! handler directory, the restart tracker and the pending restart timers.
//! Callers talk to it through a cloneable [`SupervisorHandle`]; each call is
//! a command on an mpsc channel answered over a oneshot.
//!
//! ```text
//! SupervisorHandle ──Command──► actor ──► Bundler / WorkerSpawner
//!        ▲                        │  ▲
//!        └──────── oneshot ───────┘  └── ProcessObserver (exit, createCompleted)
//!                                 ▲
//!              CredentialManager ─┘ (watch: identity changes)
//! ```
//!
//! Because bundling and spawning are awaited inside the actor, commands are
//! serialized and a directory can never end up with two processes.

pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskhost_types::exit::WorkerExit;
use taskhost_types::identity::Identity;
use taskhost_types::message::{
    CreatePayload, RestartPayload, UpdateIdentityPayload, WorkerEvent, WorkerMessage,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::bundle::{BundledModule, Bundler};
use crate::credential::CredentialManager;
use crate::discovery::{HandlerLookup, find_handler};
use crate::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::topic::derive_topic;

pub use process::{
    ProcessNotification, ProcessObserver, ProcessReport, SpawnRequest, WorkerProcess,
    WorkerSpawner,
};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor is not running")]
    Closed,
}

/// Result of a `start` or `restart` call. Failures are reported here and
/// logged; they are never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned and sent `create`.
    Spawned { topic: String },
    /// The existing process was sent `restart` with freshly bundled code.
    Reloaded { topic: String },
    /// More than one handler file; nothing runs for this directory.
    Ambiguous { files: Vec<PathBuf> },
    /// No handler file in the directory.
    Missing,
    BuildFailed,
    SpawnFailed,
}

/// Point-in-time view of one running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub directory: PathBuf,
    pub topic: String,
    pub spawn_id: u64,
    pub pid: Option<u32>,
    /// Set once the worker acknowledged `create` with `createCompleted`.
    pub ready: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Discovery root; topics are derived relative to it.
    pub root: PathBuf,
    pub restart: RestartPolicy,
    /// How long `shutdown` waits for terminated workers to exit.
    pub shutdown_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            restart: RestartPolicy::default(),
            shutdown_timeout: Duration::from_secs(6),
        }
    }
}

enum Command {
    Start {
        directory: PathBuf,
        reply: oneshot::Sender<StartOutcome>,
    },
    Restart {
        directory: PathBuf,
        reply: oneshot::Sender<StartOutcome>,
    },
    Stop {
        directory: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    ScheduledRestart {
        directory: PathBuf,
        timer_id: u64,
    },
    /// Credentials were re-acquired ahead of a scheduled restart.
    Rebootstrapped {
        directory: PathBuf,
        timer_id: u64,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Start a worker for `directory`, or reload it if one is running.
    pub async fn start(&self, directory: impl Into<PathBuf>) -> Result<StartOutcome, SupervisorError> {
        let directory = directory.into();
        self.request(|reply| Command::Start { directory, reply }).await
    }

    /// Reload the worker for `directory` with fresh code, starting it if needed.
    pub async fn restart(&self, directory: impl Into<PathBuf>) -> Result<StartOutcome, SupervisorError> {
        let directory = directory.into();
        self.request(|reply| Command::Restart { directory, reply }).await
    }

    /// Stop the worker for `directory`. Returns whether one was running.
    pub async fn stop(&self, directory: impl Into<PathBuf>) -> Result<bool, SupervisorError> {
        let directory = directory.into();
        self.request(|reply| Command::Stop { directory, reply }).await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerSnapshot>, SupervisorError> {
        self.request(|reply| Command::Workers { reply }).await
    }

    /// Terminate every worker and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Entry<P> {
    process: P,
    topic: String,
    spawn_id: u64,
    ready: bool,
    started_at: DateTime<Utc>,
}

struct PendingRestart {
    timer_id: u64,
    cancel: CancellationToken,
}

/// The supervisor actor. Construct it with [`Supervisor::spawn`].
pub struct Supervisor<B, S: WorkerSpawner> {
    config: SupervisorConfig,
    bundler: B,
    spawner: S,
    credentials: Arc<CredentialManager>,
    tx: mpsc::UnboundedSender<Command>,
    reports: mpsc::UnboundedSender<ProcessReport>,
    entries: HashMap<PathBuf, Entry<S::Process>>,
    /// Processes that were stopped or replaced and have not exited yet.
    stopping: HashMap<u64, S::Process>,
    tracker: RestartTracker,
    pending: HashMap<PathBuf, PendingRestart>,
    next_spawn_id: u64,
    next_timer_id: u64,
}

impl<B, S> Supervisor<B, S>
where
    B: Bundler + 'static,
    S: WorkerSpawner,
{
    /// Spawn the actor task and return its handle.
    pub fn spawn(
        config: SupervisorConfig,
        bundler: B,
        spawner: S,
        credentials: Arc<CredentialManager>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let identity = credentials.subscribe();
        let actor = Self {
            tracker: RestartTracker::new(config.restart),
            config,
            bundler,
            spawner,
            credentials,
            tx: tx.clone(),
            reports,
            entries: HashMap::new(),
            stopping: HashMap::new(),
            pending: HashMap::new(),
            next_spawn_id: 1,
            next_timer_id: 1,
        };
        tokio::spawn(actor.run(rx, reports_rx, identity));
        SupervisorHandle { tx }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<ProcessReport>,
        identity: watch::Receiver<Identity>,
    ) {
        let mut identity = Some(identity);
        tracing::debug!(root = %self.config.root.display(), "supervisor started");

        loop {
            tokio::select! {
                biased;

                next = next_identity(&mut identity) => {
                    if let Some(next) = next {
                        self.relay_identity(next);
                    }
                }

                Some(report) = reports.recv() => self.on_report(report),

                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown(&mut reports).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown(&mut reports).await;
                        break;
                    }
                },
            }
        }

        tracing::debug!("supervisor stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { directory, reply } => {
                let outcome = self.start(&directory).await;
                let _ = reply.send(outcome);
            }
            Command::Restart { directory, reply } => {
                let outcome = self.restart(&directory).await;
                let _ = reply.send(outcome);
            }
            Command::Stop { directory, reply } => {
                let stopped = self.stop(&directory);
                let _ = reply.send(stopped);
            }
            Command::ScheduledRestart {
                directory,
                timer_id,
            } => self.on_scheduled_restart(&directory, timer_id).await,
            Command::Rebootstrapped {
                directory,
                timer_id,
            } => self.on_rebootstrapped(&directory, timer_id).await,
            Command::Workers { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled in the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn start(&mut self, directory: &Path) -> StartOutcome {
        let entry_file = match self.lookup(directory) {
            Ok(entry_file) => entry_file,
            Err(outcome) => return outcome,
        };

        if self.entries.contains_key(directory) {
            return self.reload(directory, &entry_file).await;
        }

        let Some(module) = self.bundle(directory, &entry_file).await else {
            return StartOutcome::BuildFailed;
        };

        let topic = derive_topic(directory, &self.config.root);
        let spawn_id = self.next_spawn_id;
        self.next_spawn_id += 1;

        let observer = ProcessObserver::new(directory.to_path_buf(), spawn_id, self.reports.clone());
        let request = SpawnRequest {
            directory: directory.to_path_buf(),
            topic: topic.clone(),
        };
        let process = match self.spawner.spawn(request, observer) {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(directory = %directory.display(), topic = %topic, error = %e, "failed to spawn worker");
                return StartOutcome::SpawnFailed;
            }
        };

        let message = WorkerMessage::Create(CreatePayload {
            topic: topic.clone(),
            identity: self.credentials.current_identity(),
            module_text: module.text,
            source_path: entry_file,
            worker_id: None,
        });
        if let Err(e) = process.send(&message) {
            tracing::warn!(directory = %directory.display(), topic = %topic, error = %e, "failed to send create to worker");
        }

        tracing::info!(directory = %directory.display(), topic = %topic, spawn_id, pid = ?process.id(), "worker started");
        self.entries.insert(
            directory.to_path_buf(),
            Entry {
                process,
                topic: topic.clone(),
                spawn_id,
                ready: false,
                started_at: Utc::now(),
            },
        );

        StartOutcome::Spawned { topic }
    }

    async fn restart(&mut self, directory: &Path) -> StartOutcome {
        if !self.entries.contains_key(directory) {
            return self.start(directory).await;
        }

        match self.lookup(directory) {
            Ok(entry_file) => self.reload(directory, &entry_file).await,
            Err(outcome) => outcome,
        }
    }

    /// Send fresh code to the running process for `directory`.
    async fn reload(&mut self, directory: &Path, entry_file: &Path) -> StartOutcome {
        let Some(module) = self.bundle(directory, entry_file).await else {
            return StartOutcome::BuildFailed;
        };

        let identity = self.credentials.current_identity();
        let Some(entry) = self.entries.get_mut(directory) else {
            return StartOutcome::Missing;
        };

        let message = WorkerMessage::Restart(RestartPayload {
            topic: entry.topic.clone(),
            identity,
            module_text: module.text,
            source_path: entry_file.to_path_buf(),
        });
        if let Err(e) = entry.process.send(&message) {
            tracing::warn!(directory = %directory.display(), topic = %entry.topic, error = %e, "failed to send restart to worker");
        }
        entry.ready = false;

        tracing::info!(directory = %directory.display(), topic = %entry.topic, "worker reloaded");
        StartOutcome::Reloaded {
            topic: entry.topic.clone(),
        }
    }

    /// Resolve the single handler file for `directory`, or the outcome that
    /// blocks starting it.
    fn lookup(&mut self, directory: &Path) -> Result<PathBuf, StartOutcome> {
        match find_handler(directory) {
            HandlerLookup::Single(path) => Ok(path),
            HandlerLookup::Missing => {
                tracing::warn!(directory = %directory.display(), "no handler file found");
                Err(StartOutcome::Missing)
            }
            HandlerLookup::Ambiguous(files) => {
                let names: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
                tracing::error!(
                    directory = %directory.display(),
                    files = ?names,
                    "multiple handler files found; keep exactly one per directory"
                );
                self.stop(directory);
                Err(StartOutcome::Ambiguous { files })
            }
        }
    }

    async fn bundle(&self, directory: &Path, entry_file: &Path) -> Option<BundledModule> {
        match self.bundler.bundle(entry_file).await {
            Ok(module) => {
                for warning in &module.warnings {
                    tracing::warn!(entry = %entry_file.display(), "{warning}");
                }
                Some(module)
            }
            Err(e) => {
                tracing::error!(directory = %directory.display(), error = %e, "failed to bundle handler");
                None
            }
        }
    }

    fn stop(&mut self, directory: &Path) -> bool {
        if let Some(pending) = self.pending.remove(directory) {
            pending.cancel.cancel();
            tracing::debug!(directory = %directory.display(), "pending restart cancelled");
        }

        let Some(entry) = self.entries.remove(directory) else {
            return false;
        };

        tracing::info!(directory = %directory.display(), topic = %entry.topic, "stopping worker");
        entry.process.terminate();
        self.stopping.insert(entry.spawn_id, entry.process);
        true
    }

    fn on_report(&mut self, report: ProcessReport) {
        match report.notification {
            ProcessNotification::Exited { code } => {
                self.on_exit(&report.directory, report.spawn_id, code)
            }
            ProcessNotification::Event(event) => {
                self.on_event(&report.directory, report.spawn_id, event)
            }
        }
    }

    fn on_exit(&mut self, directory: &Path, spawn_id: u64, code: Option<i32>) {
        if self.stopping.remove(&spawn_id).is_some() {
            tracing::debug!(directory = %directory.display(), spawn_id, ?code, "stopped worker exited");
            return;
        }

        let is_current = self
            .entries
            .get(directory)
            .is_some_and(|entry| entry.spawn_id == spawn_id);
        if !is_current {
            tracing::debug!(directory = %directory.display(), spawn_id, "ignoring stale exit notification");
            return;
        }
        let Some(entry) = self.entries.remove(directory) else {
            return;
        };

        let exit = WorkerExit::from_code(code);
        if !exit.is_abnormal() {
            tracing::info!(directory = %directory.display(), topic = %entry.topic, %exit, "worker exited");
            return;
        }

        match self
            .tracker
            .record_abnormal_exit(directory, tokio::time::Instant::now())
        {
            RestartDecision::Allowed { attempt, delay } => {
                tracing::warn!(
                    directory = %directory.display(),
                    topic = %entry.topic,
                    %exit,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "worker crashed, scheduling restart"
                );
                self.schedule_restart(directory, delay);
            }
            RestartDecision::Exhausted { attempts } => {
                tracing::error!(
                    directory = %directory.display(),
                    topic = %entry.topic,
                    %exit,
                    attempts,
                    window_secs = self.tracker.policy().window.as_secs(),
                    "worker keeps crashing, giving up on automatic restarts"
                );
            }
        }
    }

    fn schedule_restart(&mut self, directory: &Path, delay: Duration) {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.pending.insert(
            directory.to_path_buf(),
            PendingRestart {
                timer_id,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }

        let tx = self.tx.clone();
        let directory = directory.to_path_buf();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Command::ScheduledRestart { directory, timer_id });
                }
            }
        });
    }

    fn is_pending(&self, directory: &Path, timer_id: u64) -> bool {
        self.pending
            .get(directory)
            .is_some_and(|pending| pending.timer_id == timer_id)
    }

    async fn on_scheduled_restart(&mut self, directory: &Path, timer_id: u64) {
        if !self.is_pending(directory, timer_id) {
            return;
        }
        if !self.credentials.has_provider() || self.credentials.is_refresh_active() {
            self.on_rebootstrapped(directory, timer_id).await;
            return;
        }

        // Acquisition retries with backoff, so it runs off the actor. The
        // restart stays pending and `stop` can still cancel it.
        tracing::info!(directory = %directory.display(), "refresh cycle inactive, re-acquiring credentials before restart");
        let credentials = Arc::clone(&self.credentials);
        let tx = self.tx.clone();
        let directory = directory.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = credentials.bootstrap().await {
                tracing::error!(directory = %directory.display(), error = %e, "failed to re-bootstrap credentials before restart");
            }
            let _ = tx.send(Command::Rebootstrapped { directory, timer_id });
        });
    }

    async fn on_rebootstrapped(&mut self, directory: &Path, timer_id: u64) {
        if !self.is_pending(directory, timer_id) {
            return;
        }
        self.pending.remove(directory);

        let outcome = self.start(directory).await;
        tracing::debug!(directory = %directory.display(), ?outcome, "scheduled restart finished");
    }

    fn on_event(&mut self, directory: &Path, spawn_id: u64, event: WorkerEvent) {
        let Some(entry) = self
            .entries
            .get_mut(directory)
            .filter(|entry| entry.spawn_id == spawn_id)
        else {
            return;
        };

        match event {
            WorkerEvent::CreateCompleted => {
                entry.ready = true;
                tracing::info!(directory = %directory.display(), topic = %entry.topic, "worker ready");
            }
        }
    }

    fn relay_identity(&self, identity: Identity) {
        tracing::debug!(user_id = %identity.user_id, workers = self.entries.len(), "relaying identity to workers");
        let message = WorkerMessage::UpdateIdentity(UpdateIdentityPayload { identity });
        for (directory, entry) in &self.entries {
            if let Err(e) = entry.process.send(&message) {
                tracing::warn!(directory = %directory.display(), topic = %entry.topic, error = %e, "failed to deliver identity update");
            }
        }
    }

    fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> = self
            .entries
            .iter()
            .map(|(directory, entry)| WorkerSnapshot {
                directory: directory.clone(),
                topic: entry.topic.clone(),
                spawn_id: entry.spawn_id,
                pid: entry.process.id(),
                ready: entry.ready,
                started_at: entry.started_at,
            })
            .collect();
        workers.sort_by(|a, b| a.directory.cmp(&b.directory));
        workers
    }

    async fn shutdown(&mut self, reports: &mut mpsc::UnboundedReceiver<ProcessReport>) {
        for (_, pending) in self.pending.drain() {
            pending.cancel.cancel();
        }

        let directories: Vec<PathBuf> = self.entries.keys().cloned().collect();
        for directory in &directories {
            self.stop(directory);
        }

        if self.stopping.is_empty() {
            return;
        }
        tracing::info!(workers = self.stopping.len(), "waiting for workers to exit");

        let drain = async {
            while !self.stopping.is_empty() {
                match reports.recv().await {
                    Some(ProcessReport {
                        spawn_id,
                        notification: ProcessNotification::Exited { .. },
                        ..
                    }) => {
                        self.stopping.remove(&spawn_id);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(workers = self.stopping.len(), "workers did not exit before shutdown timeout");
        }
    }
}

/// Next published identity; pends forever once the sender is gone.
async fn next_identity(rx: &mut Option<watch::Receiver<Identity>>) -> Option<Identity> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.changed().await {
        Ok(()) => Some(receiver.borrow_and_update().clone()),
        Err(_) => {
            *rx = None;
            None
        }
    }
}
