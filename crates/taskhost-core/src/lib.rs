//! Business logic for taskhost.
//!
//! This crate holds the supervisor, credential manager, restart policy and
//! worker runtime. Every I/O collaborator is a trait ("port") implemented in
//! `taskhost-infra`: [`bundle::Bundler`], [`credential::TokenSource`],
//! [`supervisor::WorkerSpawner`], [`runtime::ModuleLoader`] and
//! [`runtime::TaskWorkerFactory`].

pub mod backoff;
pub mod bundle;
pub mod credential;
pub mod discovery;
pub mod restart;
pub mod runtime;
pub mod supervisor;
pub mod topic;
