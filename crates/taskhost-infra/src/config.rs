//! Host configuration loader.
//!
//! Reads `taskhost.toml` and deserializes it into [`HostConfig`], then lets
//! `TASKHOST_*` environment variables override individual keys. Falls back
//! to defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use taskhost_types::config::{ENGINE_URL_ENV, HostConfig, IdentityProviderConfig};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "taskhost.toml";

pub const HANDLER_ROOT_ENV: &str = "TASKHOST_HANDLER_ROOT";
pub const AUTHORITY_URL_ENV: &str = "TASKHOST_AUTHORITY_URL";
pub const CLIENT_ID_ENV: &str = "TASKHOST_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "TASKHOST_CLIENT_SECRET";

/// Load configuration from `path` and apply overrides from the process
/// environment.
pub async fn load_host_config(path: &Path) -> HostConfig {
    let config = read_config_file(path).await;
    apply_env_overrides(config, |key| std::env::var(key).ok())
}

/// Load `{dir}/taskhost.toml`.
///
/// - If the file does not exist, returns [`HostConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn read_config_file(path: &Path) -> HostConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return HostConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return HostConfig::default();
        }
    };

    match toml::from_str::<HostConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            HostConfig::default()
        }
    }
}

/// Apply `TASKHOST_*` overrides read through `var`.
///
/// The identity section is replaced only when authority URL, client id and
/// client secret are all available (from the environment, the file, or a mix).
pub fn apply_env_overrides(mut config: HostConfig, var: impl Fn(&str) -> Option<String>) -> HostConfig {
    let lookup = |key: &str| var(key).filter(|value| !value.trim().is_empty());

    if let Some(url) = lookup(ENGINE_URL_ENV) {
        config.engine_url = url;
    }
    if let Some(root) = lookup(HANDLER_ROOT_ENV) {
        config.handler_root = Some(PathBuf::from(root));
    }

    let authority = lookup(AUTHORITY_URL_ENV);
    let client_id = lookup(CLIENT_ID_ENV);
    let client_secret = lookup(CLIENT_SECRET_ENV);
    if authority.is_none() && client_id.is_none() && client_secret.is_none() {
        return config;
    }

    let (file_authority, file_client_id, file_secret, scope) = match config.identity.take() {
        Some(identity) => (
            Some(identity.authority_url),
            Some(identity.client_id),
            Some(identity.client_secret),
            Some(identity.scope),
        ),
        None => (None, None, None, None),
    };

    let authority_url = authority.or(file_authority);
    let client_id = client_id.or(file_client_id);
    let client_secret = client_secret.map(SecretString::from).or(file_secret);

    config.identity = match (authority_url, client_id, client_secret) {
        (Some(authority_url), Some(client_id), Some(client_secret)) => Some(IdentityProviderConfig {
            authority_url,
            client_id,
            client_secret,
            scope: scope.unwrap_or_else(|| "engine_etw".to_string()),
        }),
        _ => {
            tracing::warn!(
                "Identity provider settings are incomplete; set {AUTHORITY_URL_ENV}, {CLIENT_ID_ENV} and {CLIENT_SECRET_ENV}. Running with the placeholder identity"
            );
            None
        }
    };

    config
}
