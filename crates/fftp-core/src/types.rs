//! Shared data model: connection settings, remote entries, transfer items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a registered session (one logical connection / tab).
pub type SessionId = String;

/// Identifier of a queued transfer.
pub type TransferId = String;

// ─── Connection ──────────────────────────────────────────────────────

/// Remote-file protocol selected for a connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// SSH-based file protocol.
    Sftp,
    /// Plain-text legacy file-transfer protocol.
    Ftp,
    /// Legacy protocol wrapped in TLS.
    Ftps,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp | Protocol::Ftps => 21,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Protocol::Sftp => "SFTP",
            Protocol::Ftp => "FTP",
            Protocol::Ftps => "FTPS",
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Sftp
    }
}

/// How TLS is negotiated for [`Protocol::Ftps`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TlsMode {
    /// Connect in plain text, then upgrade with `AUTH TLS`.
    Explicit,
    /// TLS from the first byte (usually port 990).
    Implicit,
}

impl Default for TlsMode {
    fn default() -> Self {
        Self::Explicit
    }
}

/// Everything needed to open one remote session.
///
/// Produced by the credential vault / connection dialog and treated as
/// read-only once a session has been established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Friendly label shown in the UI.
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Private key used instead of the password (secure protocol only).
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    /// Passive data connections (legacy protocol only).
    #[serde(default = "default_true")]
    pub passive: bool,
    #[serde(default)]
    pub tls_mode: TlsMode,
    /// Accept self-signed or otherwise unverifiable TLS certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Timeout for connect, listing and liveness checks.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub initial_directory: Option<String>,
    /// Retry a rejected legacy login with lower/upper-cased usernames.
    /// Some old servers need it; off unless the user opts in.
    #[serde(default)]
    pub legacy_login_case_retry: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: Protocol::default().default_port(),
            username: String::new(),
            password: String::new(),
            key_path: None,
            key_passphrase: None,
            protocol: Protocol::default(),
            passive: true,
            tls_mode: TlsMode::default(),
            accept_invalid_certs: false,
            timeout_secs: default_timeout_secs(),
            initial_directory: None,
            legacy_login_case_retry: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port: protocol.default_port(),
            protocol,
            ..Self::default()
        }
    }

    /// `host:port`, used in every network error message.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn uses_key(&self) -> bool {
        self.key_path.as_deref().map(|p| !p.is_empty()).unwrap_or(false)
    }
}

// ─── Listing ─────────────────────────────────────────────────────────

/// One entry of a remote directory listing.
///
/// Listings are produced fresh by every `list_files` call and are never
/// cached; conflict detection relies on that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    /// Fully-qualified remote path.
    pub path: String,
    pub is_dir: bool,
    /// Always 0 for directories.
    pub size: u64,
    /// Last-modified time as the backend reported it (display text).
    pub modified: String,
    /// The same instant as unix seconds, when it could be determined.
    #[serde(default)]
    pub modified_unix: Option<i64>,
}

// ─── Transfers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn label(self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

/// Lifecycle of a transfer item.
///
/// `Queued → Starting → Transferring → {Completed | Failed | Cancelled}`;
/// any non-terminal state may move to `Cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Queued,
    Starting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Holds a concurrency slot.
    pub fn is_running(self) -> bool {
        matches!(self, TransferStatus::Starting | TransferStatus::Transferring)
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Queued, Starting) => true,
            (Starting, Transferring) => true,
            (Starting, Failed) => true,
            (Transferring, Completed) | (Transferring, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// A single queued upload or download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub id: TransferId,
    pub session_id: SessionId,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub direction: TransferDirection,
    /// Expected size in bytes (0 when unknown at enqueue time).
    pub size: u64,
    pub transferred: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferItem {
    pub fn new(
        session_id: impl Into<SessionId>,
        direction: TransferDirection,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            direction,
            size,
            transferred: 0,
            status: TransferStatus::Queued,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::debug!(
                "transfer {}: refused transition {:?} -> {:?}",
                self.id,
                self.status,
                next
            );
            return false;
        }
        match next {
            TransferStatus::Starting => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        true
    }

    /// File name used in log lines.
    pub fn display_name(&self) -> String {
        match self.direction {
            TransferDirection::Upload => self
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.local_path.display().to_string()),
            TransferDirection::Download => crate::listing::remote_file_name(&self.remote_path).to_string(),
        }
    }
}
