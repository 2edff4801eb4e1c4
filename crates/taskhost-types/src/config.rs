//! Host configuration types for taskhost.
//!
//! `HostConfig` represents the `taskhost.toml` file that controls the engine
//! endpoint, identity provider, restart policy, worker process and bundler
//! settings. Every field has a default; the identity section is optional and
//! its absence means workers run with the placeholder identity.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

/// Flag passed to the host executable to run it as a worker process.
pub const WORKER_FLAG: &str = "--external-task-worker";

/// Environment variable carrying the engine URL into worker processes.
pub const ENGINE_URL_ENV: &str = "TASKHOST_ENGINE_URL";

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct HostConfig {
    /// Base URL of the remote process engine.
    #[serde(default = "default_engine_url")]
    pub engine_url: String,

    /// Directory scanned for handlers. Falls back to `app` / `src/app`.
    #[serde(default)]
    pub handler_root: Option<PathBuf>,

    /// OAuth2 client-credentials provider. `None` runs with the placeholder identity.
    #[serde(default)]
    pub identity: Option<IdentityProviderConfig>,

    #[serde(default)]
    pub credentials: CredentialSettings,

    #[serde(default)]
    pub restart: RestartSettings,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub bundler: BundlerSettings,
}

fn default_engine_url() -> String {
    "http://localhost:56000".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            engine_url: default_engine_url(),
            handler_root: None,
            identity: None,
            credentials: CredentialSettings::default(),
            restart: RestartSettings::default(),
            worker: WorkerSettings::default(),
            bundler: BundlerSettings::default(),
        }
    }
}

/// Identity provider settings for the client-credentials grant.
#[derive(Debug, Deserialize)]
pub struct IdentityProviderConfig {
    /// Issuer URL; the token endpoint is discovered from it.
    pub authority_url: String,
    pub client_id: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub client_secret: SecretString,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "engine_etw".to_string()
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

/// Token acquisition and refresh tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Fraction of the token lifetime after which it is refreshed.
    pub refresh_fraction: f64,
    /// Attempts before initial acquisition gives up.
    pub initial_max_attempts: u32,
    pub initial_base_delay_ms: u64,
    pub initial_max_delay_ms: u64,
    /// Backoff for failed refreshes (never gives up).
    pub refresh_retry_base_ms: u64,
    pub refresh_retry_max_ms: u64,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            refresh_fraction: 0.85,
            initial_max_attempts: 5,
            initial_base_delay_ms: 1_000,
            initial_max_delay_ms: 10_000,
            refresh_retry_base_ms: 5_000,
            refresh_retry_max_ms: 60_000,
        }
    }
}

/// Crash-restart policy tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub window_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            window_secs: 300,
            max_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Worker process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Executable to spawn. Defaults to the current executable.
    pub program: Option<PathBuf>,
    /// Arguments passed to the worker executable.
    pub args: Vec<String>,
    /// Grace period between closing a worker's stdin and killing it.
    pub shutdown_grace_ms: u64,
    /// Debounce window for filesystem events.
    pub watch_debounce_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![WORKER_FLAG.to_string()],
            shutdown_grace_ms: 5_000,
            watch_debounce_ms: 300,
        }
    }
}

/// Handler bundler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundlerSettings {
    /// Bundler executable (esbuild-compatible CLI).
    pub program: PathBuf,
    /// Packages left out of the bundle; provided at load time.
    pub external: Vec<String>,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("esbuild"),
            external: vec!["@opentelemetry/api".to_string()],
        }
    }
}
