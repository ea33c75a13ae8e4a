//! Upload collision handling.
//!
//! [`ConflictResolver::resolve`] is a pure function of the local file's
//! stat, the remote entry already holding the name, the policy and the
//! names present in the caller's listing snapshot. It never talks to the
//! server. When the policy is `ask` and the files differ, the caller gets
//! [`ConflictDecision::Ask`] and settles it through a [`ConflictPrompt`].

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeZone};
use fftp_core::{RemoteEntry, RemoteError, RemoteResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Seconds of mtime skew still counted as "same time".
pub const DEFAULT_TOLERANCE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Ask,
    Overwrite,
    Skip,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Nothing holds the name.
    Upload,
    Overwrite,
    Skip,
    /// Upload under this file name instead.
    RenameTo(String),
    /// Files differ and the user has to choose.
    Ask,
}

impl ConflictDecision {
    /// Final file name to upload under, or `None` when skipping.
    pub fn target_name(&self, original: &str) -> Option<String> {
        match self {
            ConflictDecision::Upload | ConflictDecision::Overwrite => Some(original.to_string()),
            ConflictDecision::RenameTo(name) => Some(name.clone()),
            ConflictDecision::Skip | ConflictDecision::Ask => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStat {
    pub size: u64,
    pub modified_unix: Option<i64>,
}

impl LocalStat {
    pub fn from_path(path: &Path) -> RemoteResult<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|e| RemoteError::local_io(format!("Cannot stat {}: {}", path.display(), e)))?;
        let modified_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_secs()).ok());
        Ok(Self {
            size: meta.len(),
            modified_unix,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Overwrite,
    Skip,
    Rename,
}

/// How the UI answers an `ask` decision.
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    async fn ask(&self, local: &Path, remote: &RemoteEntry) -> PromptAnswer;
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    tolerance_secs: i64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self {
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl ConflictResolver {
    pub fn resolve(
        &self,
        local: &LocalStat,
        existing: Option<&RemoteEntry>,
        policy: ConflictPolicy,
        taken: &HashSet<String>,
    ) -> ConflictDecision {
        let Some(remote) = existing else {
            return ConflictDecision::Upload;
        };
        match policy {
            ConflictPolicy::Overwrite => ConflictDecision::Overwrite,
            ConflictPolicy::Skip => ConflictDecision::Skip,
            ConflictPolicy::Rename => ConflictDecision::RenameTo(next_free_name(&remote.name, taken)),
            ConflictPolicy::Ask if self.is_identical(local, remote) => {
                log::debug!("{} is identical on both sides, skipping", remote.name);
                ConflictDecision::Skip
            }
            ConflictPolicy::Ask => ConflictDecision::Ask,
        }
    }

    /// Settle an `Ask` through `prompt`. Without a prompt the upload
    /// overwrites.
    pub async fn settle(
        &self,
        decision: ConflictDecision,
        local: &Path,
        remote: &RemoteEntry,
        taken: &HashSet<String>,
        prompt: Option<&dyn ConflictPrompt>,
    ) -> ConflictDecision {
        if decision != ConflictDecision::Ask {
            return decision;
        }
        let Some(prompt) = prompt else {
            return ConflictDecision::Overwrite;
        };
        match prompt.ask(local, remote).await {
            PromptAnswer::Overwrite => ConflictDecision::Overwrite,
            PromptAnswer::Skip => ConflictDecision::Skip,
            PromptAnswer::Rename => ConflictDecision::RenameTo(next_free_name(&remote.name, taken)),
        }
    }

    /// Same size, and modification times within the tolerance. An
    /// unknown time on either side counts as different.
    pub fn is_identical(&self, local: &LocalStat, remote: &RemoteEntry) -> bool {
        if remote.is_dir || local.size != remote.size {
            return false;
        }
        match (local.modified_unix, remote_mtime(remote)) {
            (Some(l), Some(r)) => (l - r).abs() <= self.tolerance_secs,
            _ => false,
        }
    }
}

/// The remote timestamp, from the numeric value when the backend gave
/// one, otherwise parsed from the displayed text.
pub fn remote_mtime(entry: &RemoteEntry) -> Option<i64> {
    if entry.modified_unix.is_some() {
        return entry.modified_unix;
    }
    let text = entry.modified.trim();
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%m-%d-%y %I:%M%p", "%m-%d-%Y %I:%M%p"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .and_then(|dt| Local.from_local_datetime(&dt).earliest())
        .map(|t| t.timestamp())
}

/// Names in a listing snapshot, for [`next_free_name`].
pub fn names_of(listing: &[RemoteEntry]) -> HashSet<String> {
    listing.iter().map(|e| e.name.clone()).collect()
}

/// `report.txt` → `report (1).txt`, `report (2).txt`, … until unused.
/// The extension is whatever follows the last dot, unless the name only
/// has a leading dot.
pub fn next_free_name(name: &str, taken: &HashSet<String>) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
