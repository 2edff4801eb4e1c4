//! Shared domain types for taskhost.
//!
//! This crate contains the types exchanged between the supervisor, the
//! credential manager and worker processes: Identity, the IPC message
//! protocol, worker exit codes, handler configuration and host settings.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror, secrecy.

pub mod config;
pub mod error;
pub mod exit;
pub mod handler;
pub mod identity;
pub mod message;
