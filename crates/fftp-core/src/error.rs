//! Error taxonomy shared by every backend and the transfer layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised remote-transfer error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// Protocol reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Host, path or session the error relates to.
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Credentials rejected, or no usable authentication method.
    Auth,
    /// TCP / DNS / TLS failure, or the connection dropped.
    Network,
    /// Unexpected or rejected protocol exchange.
    Protocol,
    /// Destination exists and the conflict was not resolved.
    Conflict,
    /// Local file could not be read or written.
    LocalIo,
    Timeout,
    /// Remote file or directory does not exist.
    NotFound,
    PermissionDenied,
    /// Server presented a key different from the trusted one.
    HostKeyMismatch,
    /// Operation cancelled by the user.
    Cancelled,
    /// Operation attempted on a session that is not connected.
    NotConnected,
    InvalidConfig,
}

pub type RemoteResult<T> = Result<T, RemoteError>;

// ── Construction helpers ─────────────────────────────────────────────

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            context: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Auth, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Protocol, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Conflict, msg)
    }

    pub fn local_io(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::LocalIo, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, msg)
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, msg)
    }

    pub fn host_key_mismatch(host: &str, msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::HostKeyMismatch, msg).with_context(host)
    }

    pub fn cancelled() -> Self {
        Self::new(RemoteErrorKind::Cancelled, "Transfer cancelled")
    }

    pub fn not_connected() -> Self {
        Self::new(RemoteErrorKind::NotConnected, "Not connected")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidConfig, msg)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == RemoteErrorKind::Cancelled
    }

    /// True when the error means the link itself is gone and a reconnect
    /// may help.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Network | RemoteErrorKind::NotConnected | RemoteErrorKind::Timeout
        )
    }

    /// Classify a legacy-protocol reply code into the closest error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => RemoteErrorKind::Network,
            425 | 426 => RemoteErrorKind::Network,
            430 | 530 | 532 => RemoteErrorKind::Auth,
            450 | 550 => {
                let lower = text.to_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    RemoteErrorKind::PermissionDenied
                } else if lower.contains("not found")
                    || lower.contains("no such")
                    || lower.contains("doesn't exist")
                    || lower.contains("does not exist")
                {
                    RemoteErrorKind::NotFound
                } else {
                    RemoteErrorKind::Protocol
                }
            }
            451 | 452 | 552 => RemoteErrorKind::LocalIo,
            _ => RemoteErrorKind::Protocol,
        };
        Self {
            kind,
            message: text.trim().to_string(),
            code: Some(code),
            context: None,
        }
    }

    /// User-facing troubleshooting suggestions for this failure.
    pub fn hints(&self) -> Vec<&'static str> {
        match self.kind {
            RemoteErrorKind::Auth => vec![
                "Check the username and password",
                "Check that the private key matches an authorized key on the server",
            ],
            RemoteErrorKind::Network => vec![
                "Check the host name and port",
                "Check that the server is running",
                "Check firewall settings",
            ],
            RemoteErrorKind::Timeout => vec![
                "The server did not answer in time",
                "Try passive mode if active mode is enabled",
            ],
            RemoteErrorKind::HostKeyMismatch => vec![
                "The server key changed since the last connection",
                "Verify the new key with the server administrator before trusting it",
            ],
            RemoteErrorKind::PermissionDenied => {
                vec!["The account lacks permission for this path"]
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.context) {
            (Some(code), _) => write!(f, "[{:?} {}] {}", self.kind, code, self.message),
            (None, Some(ctx)) => write!(f, "[{:?}] {}: {}", self.kind, ctx, self.message),
            (None, None) => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::timeout(format!("I/O timeout: {}", e))
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Self::network(e.to_string()),
            _ => Self::local_io(e.to_string()),
        }
    }
}

impl From<RemoteError> for String {
    fn from(e: RemoteError) -> String {
        e.to_string()
    }
}
