//! Handler entry file rules.
//!
//! A handler directory holds exactly one recognized entry file. Two or more
//! recognized files in the same directory is a configuration error that
//! blocks (re)starting the directory's worker.

use std::path::{Path, PathBuf};

/// File names recognized as handler entry points.
pub const HANDLER_FILE_NAMES: &[&str] = &["external_task.ts", "external_task.js"];

/// Whether `path` names a recognized handler entry file.
pub fn is_handler_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| HANDLER_FILE_NAMES.contains(&name))
}

/// Result of looking for a handler entry file in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerLookup {
    Missing,
    Single(PathBuf),
    Ambiguous(Vec<PathBuf>),
}

/// Look up the handler entry file of `directory`.
pub fn find_handler(directory: &Path) -> HandlerLookup {
    let mut found: Vec<PathBuf> = HANDLER_FILE_NAMES
        .iter()
        .map(|name| directory.join(name))
        .filter(|path| path.is_file())
        .collect();

    match found.len() {
        0 => HandlerLookup::Missing,
        1 => HandlerLookup::Single(found.remove(0)),
        _ => HandlerLookup::Ambiguous(found),
    }
}
