//! Handler module configuration and the merged task-worker configuration.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Optional `config` export of a handler module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerConfig {
    /// Milliseconds a fetched task stays locked to this worker.
    #[serde(default)]
    pub lock_duration: Option<u64>,
    /// Maximum number of tasks fetched per poll.
    #[serde(default)]
    pub max_tasks: Option<u32>,
    /// Milliseconds a fetch request waits for new work.
    #[serde(default)]
    pub longpolling_timeout: Option<u64>,
}

/// Configuration handed to the task-worker library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub lock_duration: Option<u64>,
    pub max_tasks: Option<u32>,
    pub longpolling_timeout: Option<u64>,
    pub identity: Identity,
    /// Preserved across `restart` so the engine sees a stable worker.
    pub worker_id: Option<String>,
}

impl WorkerConfig {
    /// Merge a handler's optional config with the identity to use.
    pub fn merge(config: Option<&HandlerConfig>, identity: Identity, worker_id: Option<String>) -> Self {
        let config = config.cloned().unwrap_or_default();
        Self {
            lock_duration: config.lock_duration,
            max_tasks: config.max_tasks,
            longpolling_timeout: config.longpolling_timeout,
            identity,
            worker_id,
        }
    }
}
