//! Canonical path algebra shared by every store backend.
//!
//! Canonical paths have exactly one leading `/`, no empty or `.`/`..`
//! segments, and directories carry a trailing `/` (the root is just `/`).

use std::collections::BTreeSet;

/// Canonicalize `path`. Repeated separators and `.` segments collapse,
/// `..` pops the previous segment.
pub fn normalize(path: &str, is_dir: bool) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut norm = String::from("/");
    norm.push_str(&segments.join("/"));
    if is_dir && norm != "/" {
        norm.push('/');
    }
    norm
}

/// Canonicalize a base directory. Always ends in `/`.
pub fn normalize_base(base_dir: &str) -> String {
    normalize(base_dir, true)
}

/// Map an absolute path into the subtree rooted at `base_dir`.
/// Paths outside the base come back canonicalized but untrimmed.
pub fn to_rel(abs_path: &str, base_dir: &str) -> String {
    let is_dir = abs_path.ends_with('/');
    let norm = normalize(abs_path, is_dir);
    let base = normalize_base(base_dir);
    let rel = norm.strip_prefix(&base).unwrap_or(&norm);
    normalize(rel, is_dir)
}

/// Inverse of [`to_rel`] for paths within the base.
pub fn to_abs(rel_path: &str, base_dir: &str) -> String {
    let is_dir = rel_path.ends_with('/');
    normalize(&format!("{base_dir}/{rel_path}"), is_dir)
}

/// Ancestor directories of `path`, shallowest first, each ending in `/`.
/// The root itself is not emitted.
pub fn parents(path: &str) -> Vec<String> {
    let norm = normalize(path, false);
    let mut out = Vec::new();
    let mut prefix = String::from("/");
    let segments: Vec<&str> = norm.trim_matches('/').split('/').collect();
    if segments.len() < 2 {
        return out;
    }
    for segment in &segments[..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        prefix.push_str(segment);
        prefix.push('/');
        out.push(prefix.clone());
    }
    out
}

/// Lexicographically ascending copy of `paths`.
pub fn sorted(paths: &[String]) -> Vec<String> {
    let mut out = paths.to_vec();
    out.sort();
    out
}

/// Distinct directory prefixes (everything up to and including the last
/// `/`) of each path, sorted ascending.
pub fn sorted_dirs(paths: &[String]) -> Vec<String> {
    let mut dirs = BTreeSet::new();
    for path in paths {
        if let Some(idx) = path.rfind('/') {
            let dir = &path[..=idx];
            if !dir.is_empty() {
                dirs.insert(dir.to_string());
            }
        }
    }
    dirs.into_iter().collect()
}

/// Partition two path sets into `(both, add, del)`.
///
/// `both` and `add` keep the order of `from`; `del` keeps the order of
/// `to`.
pub fn diff(from: &[String], to: &[String]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let from_set: BTreeSet<&str> = from.iter().map(String::as_str).collect();
    let to_set: BTreeSet<&str> = to.iter().map(String::as_str).collect();

    let mut both = Vec::new();
    let mut add = Vec::new();
    for path in from {
        if to_set.contains(path.as_str()) {
            both.push(path.clone());
        } else {
            add.push(path.clone());
        }
    }
    let del = to
        .iter()
        .filter(|path| !from_set.contains(path.as_str()))
        .cloned()
        .collect();
    (both, add, del)
}
