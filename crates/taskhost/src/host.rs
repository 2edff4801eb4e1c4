//! Host wiring: configuration, credentials, supervisor and handler watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use taskhost_core::bundle::Bundler;
use taskhost_core::credential::CredentialManager;
use taskhost_core::restart::RestartPolicy;
use taskhost_core::supervisor::{Supervisor, SupervisorConfig, SupervisorError, SupervisorHandle, WorkerSpawner};
use taskhost_infra::bundler::EsbuildBundler;
use taskhost_infra::config::{CONFIG_FILE_NAME, load_host_config};
use taskhost_infra::oidc::OidcTokenSource;
use taskhost_infra::process::ChildProcessSpawner;
use taskhost_infra::watcher::{self, HandlerWatcher, WatchError};
use taskhost_types::config::HostConfig;
use taskhost_types::error::CredentialError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::signal::shutdown_signal;

/// Extra time the supervisor waits beyond the worker grace period on shutdown.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to acquire credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("failed to prepare worker processes: {0}")]
    Spawner(#[source] anyhow::Error),

    #[error("supervisor unavailable: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Configures and starts a [`Host`].
#[derive(Debug, Default)]
pub struct HostBuilder {
    base_dir: Option<PathBuf>,
    config_file: Option<PathBuf>,
    config: Option<HostConfig>,
}

impl HostBuilder {
    /// Directory handler roots and the config file are resolved against.
    /// Defaults to the current directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Config file to load instead of `<base_dir>/taskhost.toml`.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Use `config` as is; no file is read.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = Some(config);
        self
    }

    fn resolve_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    async fn resolve_config(&mut self, base_dir: &Path) -> HostConfig {
        if let Some(config) = self.config.take() {
            return config;
        }
        let path = self
            .config_file
            .clone()
            .unwrap_or_else(|| base_dir.join(CONFIG_FILE_NAME));
        load_host_config(&path).await
    }

    /// Start with the esbuild bundler, child-process workers and, when an
    /// identity provider is configured, OIDC credentials.
    pub async fn start(mut self) -> Result<Host, HostError> {
        let base_dir = self.resolve_base_dir();
        let mut config = self.resolve_config(&base_dir).await;

        let credentials = match config.identity.take() {
            Some(provider) => {
                tracing::info!(authority = %provider.authority_url, client_id = %provider.client_id, "using identity provider");
                CredentialManager::with_source(OidcTokenSource::new(provider), config.credentials.clone())
            }
            None => CredentialManager::without_provider(config.credentials.clone()),
        };
        let bundler = EsbuildBundler::new(config.bundler.clone());
        let spawner =
            ChildProcessSpawner::from_settings(&config.worker, &config.engine_url).map_err(HostError::Spawner)?;

        Host::start_with(base_dir, config, bundler, spawner, credentials).await
    }
}

/// A running host. Dropping it without [`shutdown`](Host::shutdown) leaves
/// workers to be killed when their handles drop.
pub struct Host {
    root: PathBuf,
    supervisor: SupervisorHandle,
    credentials: Arc<CredentialManager>,
    watcher: Option<HandlerWatcher>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }

    /// Start with explicit collaborators.
    ///
    /// Fails when the handler root does not exist or when credentials cannot
    /// be acquired from a configured provider.
    pub async fn start_with<B, S>(
        base_dir: PathBuf,
        config: HostConfig,
        bundler: B,
        spawner: S,
        credentials: CredentialManager,
    ) -> Result<Self, HostError>
    where
        B: Bundler + 'static,
        S: WorkerSpawner,
    {
        let root = watcher::discover_root(&base_dir, config.handler_root.as_deref())?;
        tracing::info!(root = %root.display(), engine_url = %config.engine_url, "starting host");

        let credentials = Arc::new(credentials);
        let identity = credentials.bootstrap().await?;
        tracing::info!(user_id = %identity.user_id, placeholder = identity.is_placeholder(), "initial identity ready");

        let supervisor = Supervisor::spawn(
            SupervisorConfig {
                root: root.clone(),
                restart: RestartPolicy::from(&config.restart),
                shutdown_timeout: Duration::from_millis(config.worker.shutdown_grace_ms) + SHUTDOWN_MARGIN,
            },
            bundler,
            spawner,
            Arc::clone(&credentials),
        );

        let debounce = Duration::from_millis(config.worker.watch_debounce_ms);
        let (handler_watcher, mut events) = match watcher::watch_handlers(&root, debounce) {
            Ok(watching) => watching,
            Err(e) => {
                supervisor.shutdown().await?;
                credentials.shutdown();
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let dispatcher = {
            let cancel = cancel.clone();
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => {
                            let Some(event) = event else { break };
                            if let Err(e) = watcher::dispatch(&event, &supervisor).await {
                                tracing::warn!(error = %e, ?event, "supervisor stopped, ending handler dispatch");
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("handler dispatch finished");
            })
        };

        Ok(Self {
            root,
            supervisor,
            credentials,
            watcher: Some(handler_watcher),
            cancel,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    /// Stop watching, stop every worker and cancel the refresh cycle.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.watcher.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        if let Err(e) = self.supervisor.shutdown().await {
            tracing::debug!(error = %e, "supervisor already stopped");
        }
        self.credentials.shutdown();
        tracing::info!("host stopped");
    }

    /// Run until Ctrl+C or SIGTERM, then shut down.
    pub async fn run_until_signal(self) {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        self.shutdown().await;
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
