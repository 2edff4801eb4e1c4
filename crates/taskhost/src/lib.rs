//! taskhost: run external-task workers for a remote process engine.
//!
//! A [`Host`] discovers handler directories under the handler root, bundles
//! each handler and runs it in its own worker process, keeps those workers
//! alive with a bounded restart policy and pushes fresh credentials to them.
//!
//! The host executable doubles as the worker executable:
//!
//! ```no_run
//! # struct MyFactory;
//! # impl taskhost::TaskWorkerFactory for MyFactory {
//! #     type Worker = MyWorker;
//! #     fn create(&self, _: taskhost::TaskWorkerSpec) -> anyhow::Result<MyWorker> { unimplemented!() }
//! # }
//! # struct MyWorker;
//! # impl taskhost::TaskWorker for MyWorker {
//! #     fn worker_id(&self) -> &str { "" }
//! #     async fn stop(&mut self) {}
//! #     fn dispose(self) {}
//! #     fn set_identity(&mut self, _: taskhost::Identity) {}
//! # }
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     if taskhost::is_worker_invocation() {
//!         taskhost::worker_main(MyFactory);
//!     }
//!     let host = taskhost::Host::builder().start().await?;
//!     host.run_until_signal().await;
//!     Ok(())
//! }
//! ```

mod host;
mod signal;
mod worker;

pub use host::{Host, HostBuilder, HostError};
pub use signal::shutdown_signal;
pub use worker::{is_worker_invocation, worker_main};

pub use taskhost_core::runtime::{
    ErrorSeverity, ErrorSink, Handler, TaskWorker, TaskWorkerError, TaskWorkerFactory, TaskWorkerSpec,
};
pub use taskhost_core::supervisor::{StartOutcome, SupervisorHandle, WorkerSnapshot};
pub use taskhost_types::identity::Identity;
