#![allow(dead_code)]

use async_trait::async_trait;
use fftp::{AppSettings, TransferService, TransferSettings};
use fftp_core::memory::MemoryServer;
use fftp_core::{ConnectionConfig, Protocol, RemoteResult, RemoteSession, SessionId};
use fftp_sftp::HostTrustStore;
use fftp_transfer::{ConflictPolicy, SessionFactory};
use std::sync::Arc;

pub struct MemoryFactory(pub MemoryServer);

#[async_trait]
impl SessionFactory for MemoryFactory {
    async fn open(&self, config: &ConnectionConfig) -> RemoteResult<Box<dyn RemoteSession>> {
        Ok(Box::new(self.0.session(config.clone())))
    }
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(Protocol::Sftp, "memory", "tester")
}

pub fn settings(max_concurrent: usize, connections: usize, policy: ConflictPolicy) -> AppSettings {
    AppSettings {
        transfers: TransferSettings {
            max_concurrent_transfers: max_concurrent,
            connections_per_session: connections,
            conflict_policy: policy,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn service(settings: AppSettings) -> TransferService {
    TransferService::with_parts(settings, Arc::new(HostTrustStore::in_memory()), Default::default())
}

/// Register a memory session that may grow through a factory.
pub async fn attach(service: &TransferService, server: &MemoryServer) -> SessionId {
    let session = Box::new(server.session(config()));
    let factory: Arc<dyn SessionFactory> = Arc::new(MemoryFactory(server.clone()));
    let (id, _) = service.attach(session, Some(factory)).await.unwrap();
    id
}

pub fn write_local(dir: &std::path::Path, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}
