//! Handler discovery and filesystem watching.
//!
//! Provides:
//! - `discover_root()` -- Resolve the directory that holds handler folders
//! - `watch_handlers()` -- Initial scan plus a debounced watcher emitting [`HandlerEvent`]s
//! - `HandlerIndex` -- Classifies raw changed paths against the known handler files
//! - `dispatch()` -- Route a [`HandlerEvent`] to the supervisor

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// notify types come through the debouncer's re-export so both agree on the version.
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tokio::sync::mpsc;

use taskhost_core::discovery::{HandlerLookup, find_handler, is_handler_file};
use taskhost_core::supervisor::{SupervisorError, SupervisorHandle};

/// Candidate roots, tried in order when no custom root is configured.
pub const DEFAULT_ROOTS: &[&str] = &["app", "src/app"];

/// Directories never descended into during scans.
const SKIPPED_DIRS: &[&str] = &["node_modules"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// None of the candidate handler roots exists.
    #[error("no handler root found (searched: {})", display_paths(.searched))]
    RootNotFound { searched: Vec<PathBuf> },

    /// Failed to create the filesystem watcher.
    #[error("watcher creation failed: {0}")]
    WatcherCreation(String),

    /// Failed to add the root to the watcher.
    #[error("failed to watch path '{path}': {reason}")]
    WatchPath { path: String, reason: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Root discovery
// ---------------------------------------------------------------------------

/// Resolve the handler root.
///
/// A custom root is used as given (relative paths resolve against `base`).
/// Otherwise `app` and then `src/app` under `base` are tried.
pub fn discover_root(base: &Path, custom: Option<&Path>) -> Result<PathBuf, WatchError> {
    let candidates: Vec<PathBuf> = match custom {
        Some(custom) if custom.is_absolute() => vec![custom.to_path_buf()],
        Some(custom) => vec![base.join(custom)],
        None => DEFAULT_ROOTS.iter().map(|root| base.join(root)).collect(),
    };

    candidates
        .iter()
        .find(|candidate| candidate.is_dir())
        .cloned()
        .ok_or(WatchError::RootNotFound {
            searched: candidates,
        })
}

// ---------------------------------------------------------------------------
// Events and classification
// ---------------------------------------------------------------------------

/// A change to a handler entry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl HandlerEvent {
    /// The handler entry file.
    pub fn file(&self) -> &Path {
        match self {
            HandlerEvent::Added(file) | HandlerEvent::Changed(file) | HandlerEvent::Removed(file) => file,
        }
    }

    /// The handler directory (the entry file's parent).
    pub fn directory(&self) -> &Path {
        self.file().parent().unwrap_or_else(|| Path::new(""))
    }
}

/// Known handler entry files under a root.
#[derive(Debug, Default)]
pub struct HandlerIndex {
    known: BTreeSet<PathBuf>,
}

impl HandlerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.known.contains(file)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Scan `root` recursively and record every handler file as Added.
    pub fn scan(&mut self, root: &Path) -> Vec<HandlerEvent> {
        let mut found = Vec::new();
        collect_handler_files(root, &mut found);
        found.sort();

        found
            .into_iter()
            .filter(|file| self.known.insert(file.clone()))
            .map(HandlerEvent::Added)
            .collect()
    }

    /// Classify one changed path reported by the watcher.
    ///
    /// - handler file, exists, unknown -> Added
    /// - handler file, exists, known -> Changed
    /// - handler file, missing, known -> Removed
    /// - missing path (a removed directory) -> Removed for every known file beneath it
    /// - existing directory (created or moved in) -> Added for new handler files inside
    pub fn classify(&mut self, path: &Path) -> Vec<HandlerEvent> {
        if is_handler_file(path) {
            if path.is_file() {
                if self.known.contains(path) {
                    return vec![HandlerEvent::Changed(path.to_path_buf())];
                }
                self.known.insert(path.to_path_buf());
                return vec![HandlerEvent::Added(path.to_path_buf())];
            }
            if self.known.remove(path) {
                return vec![HandlerEvent::Removed(path.to_path_buf())];
            }
            return Vec::new();
        }

        if path.is_dir() {
            return self.scan(path);
        }

        if !path.exists() {
            let removed: Vec<PathBuf> = self
                .known
                .iter()
                .filter(|file| file.starts_with(path))
                .cloned()
                .collect();
            for file in &removed {
                self.known.remove(file);
            }
            return removed.into_iter().map(HandlerEvent::Removed).collect();
        }

        Vec::new()
    }
}

fn collect_handler_files(dir: &Path, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_handler_files(&path, found);
        } else if is_handler_file(&path) && path.is_file() {
            found.push(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Watcher lifecycle
// ---------------------------------------------------------------------------

/// RAII handle that keeps the handler watcher alive.
pub struct HandlerWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    root: PathBuf,
    index: Arc<Mutex<HandlerIndex>>,
}

impl HandlerWatcher {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of handler files currently known.
    pub fn known_handlers(&self) -> usize {
        match self.index.lock() {
            Ok(index) => index.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Drop for HandlerWatcher {
    fn drop(&mut self) {
        tracing::debug!(root = %self.root.display(), "handler watcher dropped");
    }
}

fn lock(index: &Mutex<HandlerIndex>) -> std::sync::MutexGuard<'_, HandlerIndex> {
    match index.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Watch `root` for handler changes.
///
/// The receiver first yields an Added event for every handler file present
/// at startup, then live events. Watcher errors are logged and not fatal.
pub fn watch_handlers(
    root: &Path,
    debounce: Duration,
) -> Result<(HandlerWatcher, mpsc::UnboundedReceiver<HandlerEvent>), WatchError> {
    let (tx, rx) = mpsc::unbounded_channel::<HandlerEvent>();
    let index = Arc::new(Mutex::new(HandlerIndex::new()));

    let callback_index = Arc::clone(&index);
    let callback_tx = tx.clone();
    let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
        Ok(events) => {
            let mut index = lock(&callback_index);
            for event in events {
                for handler_event in index.classify(&event.path) {
                    tracing::debug!(event = ?handler_event, "handler change detected");
                    let _ = callback_tx.send(handler_event);
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "handler watcher error");
        }
    })
    .map_err(|e| WatchError::WatcherCreation(e.to_string()))?;

    debouncer
        .watcher()
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| WatchError::WatchPath {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;

    let initial = lock(&index).scan(root);
    tracing::info!(root = %root.display(), handlers = initial.len(), "handler watcher started");
    for event in initial {
        let _ = tx.send(event);
    }

    let watcher = HandlerWatcher {
        _debouncer: debouncer,
        root: root.to_path_buf(),
        index,
    };
    Ok((watcher, rx))
}

/// Route a handler event to the supervisor: Added starts, Changed restarts,
/// Removed stops.
///
/// A removal that leaves another entry file in the directory (the directory
/// was ambiguous) starts the remaining one instead.
pub async fn dispatch(event: &HandlerEvent, supervisor: &SupervisorHandle) -> Result<(), SupervisorError> {
    let directory = event.directory().to_path_buf();
    match event {
        HandlerEvent::Added(_) => {
            let outcome = supervisor.start(directory).await?;
            tracing::debug!(?outcome, "dispatched handler addition");
        }
        HandlerEvent::Changed(_) => {
            let outcome = supervisor.restart(directory).await?;
            tracing::debug!(?outcome, "dispatched handler change");
        }
        HandlerEvent::Removed(_) => match find_handler(&directory) {
            HandlerLookup::Missing => {
                supervisor.stop(directory).await?;
            }
            HandlerLookup::Single(_) | HandlerLookup::Ambiguous(_) => {
                let outcome = supervisor.start(directory).await?;
                tracing::debug!(?outcome, "entry file removed, another one remains");
            }
        },
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
