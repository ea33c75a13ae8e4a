//! Listing order and remote (always `/`-separated) path helpers.

use crate::types::RemoteEntry;
use std::cmp::Ordering;

/// Directories first, then case-insensitive name; exact name breaks ties
/// so the order is total.
pub fn compare_entries(a: &RemoteEntry, b: &RemoteEntry) -> Ordering {
    b.is_dir
        .cmp(&a.is_dir)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

pub fn sort_entries(entries: &mut [RemoteEntry]) {
    entries.sort_by(compare_entries);
}

/// `"."` and `""` both mean "the current working directory".
pub fn is_current_dir(path: &str) -> bool {
    let p = path.trim();
    p.is_empty() || p == "."
}

/// Join a directory and a child name.
pub fn join_remote(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() || dir == "." {
        return name.to_string();
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last path component (`/a/b.txt` → `b.txt`).
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Parent directory (`/a/b.txt` → `/a`, `/a` → `/`, `b` → `.`).
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => trimmed[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Collapse `.`/`..` segments and duplicate slashes. Relative paths are
/// resolved against `cwd`.
pub fn normalize_remote(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else if is_current_dir(path) {
        cwd.to_string()
    } else {
        join_remote(if cwd.is_empty() { "/" } else { cwd }, path)
    };
    let mut parts: Vec<&str> = Vec::new();
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}
