//! Path arithmetic for graph addresses
//!
//! Every entry in a graph lives at exactly one path: the keys from the root
//! down to the entry, joined with [`SEPARATOR`].

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Join a parent path and a key into a child path.
pub fn join(parent: &str, key: &str) -> String {
    let mut path = String::with_capacity(parent.len() + key.len() + 1);
    path.push_str(parent);
    path.push(SEPARATOR);
    path.push_str(key);
    path
}

/// Split a path into its segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR)
}

/// Split a path into its parent path (if any) and final key.
pub fn parent_and_key(path: &str) -> (Option<&str>, &str) {
    match path.rfind(SEPARATOR) {
        Some(index) => (Some(&path[..index]), &path[index + 1..]),
        None => (None, path),
    }
}

/// The parent path, or `None` for a root-level key.
pub fn parent(path: &str) -> Option<&str> {
    parent_and_key(path).0
}

/// Whether `path` equals `prefix` or lies underneath it.
///
/// Matching is segment-aware: `a/b` is under `a`, `ab` is not.
pub fn is_under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Every proper ancestor of `path`, nearest first.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = parent(path);
    std::iter::from_fn(move || {
        let next = current?;
        current = parent(next);
        Some(next)
    })
}
