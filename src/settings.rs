//! Persisted settings, stored as JSON under `~/.fftp/`.

use fftp_core::{RemoteError, RemoteResult};
use fftp_transfer::{ConflictPolicy, QueueConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = ".fftp";
const SETTINGS_FILE: &str = "settings.json";
const TRUST_FILE: &str = "known_hosts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferSettings {
    pub max_concurrent_transfers: usize,
    /// Per-transfer cap in bytes per second; 0 = unlimited.
    pub speed_limit_bytes_per_sec: u64,
    /// Read/write buffer size for the backends; 0 = backend default.
    pub chunk_size: usize,
    pub conflict_policy: ConflictPolicy,
    /// How many connections one session may open for parallel transfers.
    pub connections_per_session: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 10,
            speed_limit_bytes_per_sec: 0,
            chunk_size: 64 * 1024,
            conflict_policy: ConflictPolicy::Ask,
            connections_per_session: 1,
        }
    }
}

impl TransferSettings {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent_transfers.max(1),
            speed_limit_bytes_per_sec: self.speed_limit_bytes_per_sec,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub transfers: TransferSettings,
    /// Overrides the default `~/.fftp/known_hosts`.
    pub trust_store_path: Option<PathBuf>,
    /// `RUST_LOG`-style filter, e.g. `info,fftp_ftp=debug`.
    pub log_filter: Option<String>,
}

impl AppSettings {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> RemoteResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("{} not found, using default settings", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(RemoteError::from(e).with_context(path.display().to_string())),
        };
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::invalid_config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> RemoteResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RemoteError::from(e).with_context(parent.display().to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::invalid_config(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| RemoteError::from(e).with_context(path.display().to_string()))
    }

    pub fn trust_store_path(&self) -> Option<PathBuf> {
        self.trust_store_path.clone().or_else(default_trust_store_path)
    }
}

/// `~/.fftp`, or `None` when there is no home directory.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(APP_DIR))
}

pub fn default_settings_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(SETTINGS_FILE))
}

pub fn default_trust_store_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join(TRUST_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = AppSettings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s, AppSettings::default());
        assert_eq!(s.transfers.queue_config().max_concurrent, 10);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"transfers":{"speedLimitBytesPerSec":2048,"conflictPolicy":"skip"}}"#).unwrap();
        let s = AppSettings::load(&path).unwrap();
        assert_eq!(s.transfers.speed_limit_bytes_per_sec, 2048);
        assert_eq!(s.transfers.conflict_policy, ConflictPolicy::Skip);
        assert_eq!(s.transfers.max_concurrent_transfers, 10);
    }

    #[test]
    fn broken_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{").unwrap();
        let err = AppSettings::load(&path).unwrap_err();
        assert_eq!(err.kind, fftp_core::RemoteErrorKind::InvalidConfig);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let t = TransferSettings {
            max_concurrent_transfers: 0,
            ..Default::default()
        };
        assert_eq!(t.queue_config().max_concurrent, 1);
    }
}
