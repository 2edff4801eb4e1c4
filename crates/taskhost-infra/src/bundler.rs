//! esbuild-backed [`Bundler`].
//!
//! Runs the esbuild CLI on a handler entry file and captures the bundle from
//! stdout. The output is a single CommonJS module for Node with an inline
//! source map; packages listed in [`BundlerSettings::external`] are left as
//! `require` calls and resolved when the worker loads the module.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use taskhost_core::bundle::{BundledModule, Bundler};
use taskhost_types::config::BundlerSettings;
use taskhost_types::error::BuildError;

/// Upper bound for a single bundle run.
const BUNDLE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct EsbuildBundler {
    settings: BundlerSettings,
}

impl EsbuildBundler {
    pub fn new(settings: BundlerSettings) -> Self {
        Self { settings }
    }

    fn args(&self, entry: &Path) -> Vec<String> {
        let mut args = vec![
            entry.display().to_string(),
            "--bundle".to_string(),
            "--platform=node".to_string(),
            "--format=cjs".to_string(),
            "--sourcemap=inline".to_string(),
            "--log-level=warning".to_string(),
            "--color=false".to_string(),
        ];
        args.extend(
            self.settings
                .external
                .iter()
                .map(|package| format!("--external:{package}")),
        );
        args
    }
}

/// Split esbuild's stderr into individual diagnostics (blank-line separated).
fn diagnostics(stderr: &str) -> Vec<String> {
    stderr
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(str::to_string)
        .collect()
}

impl Bundler for EsbuildBundler {
    async fn bundle(&self, entry: &Path) -> Result<BundledModule, BuildError> {
        let entry_name = entry.display().to_string();
        let working_dir = entry.parent().unwrap_or_else(|| Path::new("."));

        let child = tokio::process::Command::new(&self.settings.program)
            .args(self.args(entry))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildError::Spawn {
                entry: entry_name.clone(),
                reason: format!("{}: {e}", self.settings.program.display()),
            })?;

        let output = tokio::time::timeout(
            Duration::from_secs(BUNDLE_TIMEOUT_SECS),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| BuildError::Spawn {
            entry: entry_name.clone(),
            reason: format!("bundler timed out after {BUNDLE_TIMEOUT_SECS}s"),
        })?
        .map_err(|e| BuildError::Spawn {
            entry: entry_name.clone(),
            reason: e.to_string(),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let mut diagnostics = diagnostics(&stderr);
            if diagnostics.is_empty() {
                diagnostics.push(format!("bundler exited with {}", output.status));
            }
            return Err(BuildError::Failed {
                entry: entry_name,
                diagnostics,
            });
        }

        let text = String::from_utf8(output.stdout).map_err(|e| BuildError::InvalidOutput {
            entry: entry_name.clone(),
            reason: format!("bundle is not valid UTF-8: {e}"),
        })?;
        if text.trim().is_empty() {
            return Err(BuildError::InvalidOutput {
                entry: entry_name,
                reason: "bundle is empty".to_string(),
            });
        }

        tracing::debug!(entry = %entry_name, bytes = text.len(), "handler bundled");
        Ok(BundledModule {
            text,
            warnings: diagnostics(&stderr),
        })
    }
}
