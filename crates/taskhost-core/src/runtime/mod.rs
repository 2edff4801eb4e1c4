//! Worker runtime: the control loop that runs inside each worker process.
//!
//! The runtime reads [`WorkerMessage`](taskhost_types::message::WorkerMessage)s
//! from the supervisor, loads handler modules through a [`ModuleLoader`] and
//! drives one task worker built by a [`TaskWorkerFactory`]. Polling, locking
//! and completing tasks against the engine is the task worker's business;
//! this crate only manages its lifecycle.

mod worker;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use taskhost_types::handler::{HandlerConfig, WorkerConfig};
use taskhost_types::identity::Identity;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use worker::WorkerRuntime;

// ---------------------------------------------------------------------------
// Handler modules
// ---------------------------------------------------------------------------

/// A loaded handler's default export.
pub trait Handler: Send + Sync {
    /// Run the handler for one task. `cancel` fires when the task worker
    /// stops or the task's lock is lost.
    fn invoke(&self, payload: Value, task: Value, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<Value>>;
}

/// Module text to load, as shipped in `create`/`restart`.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub topic: String,
    /// Original entry file, so stack traces point at real source.
    pub source_path: PathBuf,
    pub text: String,
}

pub struct LoadedModule {
    pub handler: Arc<dyn Handler>,
    pub config: Option<HandlerConfig>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to write module to disk: {0}")]
    Write(#[from] std::io::Error),

    #[error("module {path} has no default export")]
    MissingDefaultExport { path: PathBuf },

    #[error("module {path} failed to evaluate: {reason}")]
    Evaluate { path: PathBuf, reason: String },

    #[error("module {path} exports an invalid config: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },
}

/// Turns module text into a callable handler.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, source: &ModuleSource) -> impl Future<Output = Result<LoadedModule, LoadError>> + Send;
}

// ---------------------------------------------------------------------------
// Task workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// One task failed; the worker keeps polling.
    Task,
    /// The worker cannot continue; the process exits with code 3.
    Fatal,
}

/// An error reported by a running task worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWorkerError {
    pub severity: ErrorSeverity,
    pub message: String,
    pub task_id: Option<String>,
}

impl TaskWorkerError {
    pub fn task(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Task,
            message: message.into(),
            task_id: Some(task_id.into()),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: ErrorSeverity::Fatal,
            message: message.into(),
            task_id: None,
        }
    }
}

/// Where a task worker reports errors.
///
/// Each sink belongs to one created worker. Reports from a worker that has
/// since been replaced or torn down are dropped by the runtime.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<(u64, TaskWorkerError)>,
    generation: u64,
}

impl ErrorSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<(u64, TaskWorkerError)>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn report(&self, error: TaskWorkerError) {
        let _ = self.tx.send((self.generation, error));
    }
}

/// Everything a factory needs to build a task worker.
pub struct TaskWorkerSpec {
    pub engine_url: String,
    pub topic: String,
    pub handler: Arc<dyn Handler>,
    pub config: WorkerConfig,
    pub errors: ErrorSink,
}

/// A running subscription to one topic. Polling starts on creation.
pub trait TaskWorker: Send + 'static {
    fn worker_id(&self) -> &str;

    /// Stop polling and wait for in-flight tasks to settle.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;

    /// Release resources. Called after `stop`.
    fn dispose(self);

    /// Use `identity` for all subsequent engine calls.
    fn set_identity(&mut self, identity: Identity);
}

/// Builds task workers; supplied by the host application.
pub trait TaskWorkerFactory: Send + Sync + 'static {
    type Worker: TaskWorker;

    fn create(&self, spec: TaskWorkerSpec) -> anyhow::Result<Self::Worker>;
}
