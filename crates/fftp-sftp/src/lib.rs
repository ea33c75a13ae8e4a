//! # fftp-sftp
//!
//! Secure (SSH file-transfer) backend for the fftp session layer.
//!
//! - [`SecureSession`]: `RemoteSession` over libssh2, with every blocking
//!   call moved onto tokio's blocking pool
//! - [`HostTrustStore`]: persisted host identities, trusted on first use

pub mod sftp;

pub use sftp::session::SecureSession;
pub use sftp::trust::{HostIdentity, HostTrustStore, MismatchAction, MismatchPolicy, TrustDecision};
