//! Worker process entry point.

use std::ffi::OsString;

use taskhost_core::runtime::{TaskWorkerFactory, WorkerRuntime};
use taskhost_infra::loader::{Interpreter, NodeModuleLoader};
use taskhost_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use taskhost_types::config::{ENGINE_URL_ENV, HostConfig, WORKER_FLAG};
use taskhost_types::exit::{EXIT_UNCAUGHT_EXCEPTION, EXIT_WORKER_ERROR};
use tokio::io::BufReader;

use crate::signal::shutdown_signal;

/// Whether this process was launched by the supervisor as a worker.
pub fn is_worker_invocation() -> bool {
    has_worker_flag(std::env::args_os().skip(1))
}

fn has_worker_flag(args: impl IntoIterator<Item = OsString>) -> bool {
    args.into_iter().any(|arg| arg == WORKER_FLAG)
}

fn engine_url(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup(ENGINE_URL_ENV)
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| HostConfig::default().engine_url)
}

/// Run this process as a worker and exit with the runtime's exit code.
///
/// Reads control messages from stdin and answers on stdout, so nothing else
/// may write to stdout. Logs go to stderr. A panic anywhere exits with
/// code 4.
pub fn worker_main<F: TaskWorkerFactory>(factory: F) -> ! {
    if let Err(e) = init_tracing(TracingOptions::worker()) {
        eprintln!("Warning: tracing already initialized: {e}");
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(EXIT_UNCAUGHT_EXCEPTION);
    }));

    let code = run(factory);
    shutdown_tracing();
    std::process::exit(code)
}

fn run<F: TaskWorkerFactory>(factory: F) -> i32 {
    let engine_url = engine_url(|key| std::env::var(key).ok());

    let loader = match NodeModuleLoader::new(Interpreter::from_env()) {
        Ok(loader) => loader,
        Err(e) => {
            tracing::error!(error = %e, "failed to create module directory");
            return EXIT_WORKER_ERROR;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return EXIT_WORKER_ERROR;
        }
    };

    tracing::info!(pid = std::process::id(), engine_url = %engine_url, "worker process started");
    let worker = WorkerRuntime::new(loader, factory, engine_url);
    let code = runtime.block_on(worker.run(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown_signal(),
    ));
    tracing::info!(code, "worker process exiting");
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn worker_flag_detection() {
        assert!(has_worker_flag(args(&["--external-task-worker"])));
        assert!(has_worker_flag(args(&["--verbose", "--external-task-worker"])));
        assert!(!has_worker_flag(args(&[])));
        assert!(!has_worker_flag(args(&["--external-task-worker=1"])));
    }

    #[test]
    fn engine_url_from_environment_or_default() {
        assert_eq!(
            engine_url(|_| Some("http://engine:8080".to_string())),
            "http://engine:8080"
        );
        assert_eq!(engine_url(|_| None), "http://localhost:56000");
        assert_eq!(engine_url(|_| Some(String::new())), "http://localhost:56000");
    }
}
