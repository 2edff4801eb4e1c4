//! Transpiler seam.
//!
//! A [`Bundler`] turns a handler entry file into a single self-contained
//! module. The supervisor keeps the result in memory and ships it to the
//! worker process; it never touches disk.

use std::future::Future;
use std::path::Path;

use taskhost_types::error::BuildError;

/// Output of a successful bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundledModule {
    /// Module source, ready to be loaded by the worker's interpreter.
    pub text: String,
    /// Non-fatal diagnostics reported by the bundler.
    pub warnings: Vec<String>,
}

impl BundledModule {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            warnings: Vec::new(),
        }
    }
}

/// Bundles a handler entry file into module text.
pub trait Bundler: Send + Sync {
    fn bundle(&self, entry: &Path) -> impl Future<Output = Result<BundledModule, BuildError>> + Send;
}
