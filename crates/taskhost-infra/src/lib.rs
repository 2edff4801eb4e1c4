//! Infrastructure layer for taskhost.
//!
//! Implements the ports defined in `taskhost-core` against the outside world:
//! the OIDC client-credentials token source, the esbuild bundler, the
//! child-process spawner with its JSON-lines IPC, the Node module loader used
//! inside workers, the handler directory watcher and the `taskhost.toml`
//! configuration loader.

pub mod bundler;
pub mod config;
pub mod loader;
pub mod oidc;
pub mod process;
pub mod watcher;
