//! Observability setup for taskhost: the `tracing` subscriber for the host
//! and for worker processes.

pub mod tracing_setup;
