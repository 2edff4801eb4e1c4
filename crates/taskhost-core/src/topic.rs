//! Topic derivation from handler directory locations.
//!
//! A topic is the handler directory's path relative to the discovery root,
//! with route-group segments (`(name)`) dropped and separators normalized.

use std::path::Path;

/// Derive the topic for a handler directory.
///
/// `directory` may be absolute or relative; if it lies under `root` the root
/// prefix is removed first. An empty `root` leaves the directory as-is.
pub fn derive_topic(directory: &Path, root: &Path) -> String {
    let relative = if root.as_os_str().is_empty() {
        directory
    } else {
        directory.strip_prefix(root).unwrap_or(directory)
    };
    normalize_topic(&relative.to_string_lossy())
}

/// Normalize a raw relative path string into a topic.
///
/// - strips a leading `./`
/// - drops parenthesized route-group segments such as `(admin)`
/// - collapses repeated slashes and trims leading/trailing slashes
/// - treats `\` as a separator
pub fn normalize_topic(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let trimmed = unified.strip_prefix("./").unwrap_or(&unified);

    trimmed
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .filter(|segment| !is_route_group(segment))
        .collect::<Vec<_>>()
        .join("/")
}

fn is_route_group(segment: &str) -> bool {
    segment.len() >= 2 && segment.starts_with('(') && segment.ends_with(')')
}
