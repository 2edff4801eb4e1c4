//! Worker process port.
//!
//! The supervisor never touches OS processes directly. A [`WorkerSpawner`]
//! launches one child per handler directory and hands back a
//! [`WorkerProcess`] for sending control messages; exit and
//! `createCompleted` notifications come back through the
//! [`ProcessObserver`] passed in at spawn time.

use std::path::{Path, PathBuf};

use taskhost_types::error::IpcError;
use taskhost_types::message::{WorkerEvent, WorkerMessage};
use tokio::sync::mpsc;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub directory: PathBuf,
    pub topic: String,
}

/// A live worker process.
pub trait WorkerProcess: Send + Sync + 'static {
    /// Queue a control message. Messages are delivered in send order.
    fn send(&self, message: &WorkerMessage) -> Result<(), IpcError>;

    /// Ask the process to stop. Implementations disconnect IPC first and
    /// force-kill once their grace period is over.
    fn terminate(&self);

    /// OS process id, when known.
    fn id(&self) -> Option<u32>;
}

/// Launches worker processes.
pub trait WorkerSpawner: Send + Sync + 'static {
    type Process: WorkerProcess;

    fn spawn(
        &self,
        request: SpawnRequest,
        observer: ProcessObserver,
    ) -> anyhow::Result<Self::Process>;
}

/// Something that happened to a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessNotification {
    /// The process exited. `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// The process emitted an event on its IPC channel.
    Event(WorkerEvent),
}

/// A [`ProcessNotification`] tagged with the process it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub directory: PathBuf,
    pub spawn_id: u64,
    pub notification: ProcessNotification,
}

/// Reports lifecycle events of one spawned process back to the supervisor.
///
/// Tagged with the spawn id so that notifications from a replaced process
/// are recognized as stale.
#[derive(Debug, Clone)]
pub struct ProcessObserver {
    directory: PathBuf,
    spawn_id: u64,
    tx: mpsc::UnboundedSender<ProcessReport>,
}

impl ProcessObserver {
    pub fn new(directory: PathBuf, spawn_id: u64, tx: mpsc::UnboundedSender<ProcessReport>) -> Self {
        Self {
            directory,
            spawn_id,
            tx,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn spawn_id(&self) -> u64 {
        self.spawn_id
    }

    pub fn exited(&self, code: Option<i32>) {
        self.report(ProcessNotification::Exited { code });
    }

    pub fn event(&self, event: WorkerEvent) {
        self.report(ProcessNotification::Event(event));
    }

    fn report(&self, notification: ProcessNotification) {
        let _ = self.tx.send(ProcessReport {
            directory: self.directory.clone(),
            spawn_id: self.spawn_id,
            notification,
        });
    }
}
