//! Backend selection. The protocol tag is looked at exactly once, here;
//! everything past this point talks to `dyn RemoteSession`.

use async_trait::async_trait;
use fftp_core::{ConnectionConfig, Protocol, RemoteError, RemoteResult, RemoteSession};
use fftp_ftp::LegacySession;
use fftp_sftp::{HostTrustStore, SecureSession};
use fftp_transfer::SessionFactory;
use std::sync::Arc;

/// A not yet connected session for `config`. `chunk_size` of 0 keeps the
/// backend's own default.
pub fn open_session(
    config: ConnectionConfig,
    trust: Arc<HostTrustStore>,
    chunk_size: usize,
) -> Box<dyn RemoteSession> {
    match (config.protocol, chunk_size) {
        (Protocol::Sftp, 0) => Box::new(SecureSession::new(config, trust)),
        (Protocol::Sftp, n) => Box::new(SecureSession::new(config, trust).with_chunk_size(n)),
        (Protocol::Ftp | Protocol::Ftps, 0) => Box::new(LegacySession::new(config)),
        (Protocol::Ftp | Protocol::Ftps, n) => Box::new(LegacySession::new(config).with_chunk_size(n)),
    }
}

/// Reject configs that cannot possibly connect.
pub fn validate(config: &ConnectionConfig) -> RemoteResult<()> {
    if config.host.trim().is_empty() {
        return Err(RemoteError::invalid_config("Host is required"));
    }
    if config.port == 0 {
        return Err(RemoteError::invalid_config("Port must be between 1 and 65535"));
    }
    if config.protocol == Protocol::Sftp && config.username.trim().is_empty() {
        return Err(RemoteError::invalid_config("A username is required for SFTP"));
    }
    Ok(())
}

/// Multi-line message for a failed connect: what went wrong, where, and
/// what to check.
pub fn connection_report(config: &ConnectionConfig, err: &RemoteError) -> String {
    let mut out = format!(
        "Could not connect to {} ({}): {}",
        config.address(),
        config.protocol.label(),
        err
    );
    for hint in err.hints() {
        out.push_str("\n  - ");
        out.push_str(hint);
    }
    out
}

/// Opens extra pooled connections with the same backend choice.
pub struct BackendFactory {
    trust: Arc<HostTrustStore>,
    chunk_size: usize,
}

impl BackendFactory {
    pub fn new(trust: Arc<HostTrustStore>, chunk_size: usize) -> Self {
        Self { trust, chunk_size }
    }
}

#[async_trait]
impl SessionFactory for BackendFactory {
    async fn open(&self, config: &ConnectionConfig) -> RemoteResult<Box<dyn RemoteSession>> {
        Ok(open_session(config.clone(), self.trust.clone(), self.chunk_size))
    }
}
