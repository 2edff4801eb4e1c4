//! Worker process exit codes.
//!
//! The supervisor only auto-restarts workers that exit with
//! [`EXIT_WORKER_ERROR`] or [`EXIT_UNCAUGHT_EXCEPTION`]. Every other status,
//! including termination by signal, is a clean stop.

/// Normal shutdown (stop request, IPC disconnect, termination signal).
pub const EXIT_CLEAN: i32 = 0;

/// The task worker reported an error it classified as fatal to the process.
pub const EXIT_WORKER_ERROR: i32 = 3;

/// An uncaught panic escaped the worker runtime.
pub const EXIT_UNCAUGHT_EXCEPTION: i32 = 4;

/// Classified exit status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    WorkerError,
    UncaughtException,
    /// Any other exit code. Treated as clean.
    Other(i32),
    /// Terminated by a signal (no exit code available).
    Signaled,
}

impl WorkerExit {
    /// Classify a raw exit code as reported by the OS.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_CLEAN) => WorkerExit::Clean,
            Some(EXIT_WORKER_ERROR) => WorkerExit::WorkerError,
            Some(EXIT_UNCAUGHT_EXCEPTION) => WorkerExit::UncaughtException,
            Some(other) => WorkerExit::Other(other),
            None => WorkerExit::Signaled,
        }
    }

    /// Whether this exit should be handed to the restart policy.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, WorkerExit::WorkerError | WorkerExit::UncaughtException)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Clean => write!(f, "clean (0)"),
            WorkerExit::WorkerError => write!(f, "worker error ({EXIT_WORKER_ERROR})"),
            WorkerExit::UncaughtException => {
                write!(f, "uncaught exception ({EXIT_UNCAUGHT_EXCEPTION})")
            }
            WorkerExit::Other(code) => write!(f, "exit code {code}"),
            WorkerExit::Signaled => write!(f, "terminated by signal"),
        }
    }
}
