//! `RemoteSession` over the legacy protocol (plain, explicit or implicit
//! TLS).

use crate::ftp::client::FtpClient;
use async_trait::async_trait;
use fftp_core::listing::{is_current_dir, join_remote, sort_entries};
use fftp_core::{
    ConnectionConfig, Protocol, RemoteEntry, RemoteError, RemoteResult, RemoteSession,
    TransferControl,
};
use std::path::Path;

pub struct LegacySession {
    config: ConnectionConfig,
    client: Option<FtpClient>,
    chunk_size: Option<usize>,
}

impl LegacySession {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            client: None,
            chunk_size: None,
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    fn client(&mut self) -> RemoteResult<&mut FtpClient> {
        self.client.as_mut().ok_or_else(RemoteError::not_connected)
    }

    /// Forget the control connection once it is dead or its replies can no
    /// longer be matched to commands (a timed-out read leaves a late reply
    /// in the stream).
    fn observe<T>(&mut self, result: RemoteResult<T>) -> RemoteResult<T> {
        if let Err(e) = &result {
            if e.is_connection_lost() {
                log::warn!("{}: connection lost: {}", self.config.address(), e);
                self.client = None;
            }
        }
        result
    }
}

#[async_trait]
impl RemoteSession for LegacySession {
    fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn connect(&mut self) -> RemoteResult<String> {
        self.disconnect().await;
        let mut client = FtpClient::connect(self.config.clone()).await?;
        if let Some(size) = self.chunk_size {
            client.set_chunk_size(size);
        }
        let message = format!(
            "Connected to {} ({})\n{}",
            self.config.address(),
            self.config.protocol.label(),
            client.banner()
        );
        self.client = Some(client);
        Ok(message)
    }

    async fn current_directory(&mut self) -> String {
        let Ok(client) = self.client() else {
            return ".".to_string();
        };
        match client.pwd().await {
            Ok(dir) => dir,
            Err(e) => {
                log::debug!("PWD failed: {}", e);
                ".".to_string()
            }
        }
    }

    async fn is_connected(&mut self) -> bool {
        let Ok(client) = self.client() else {
            return false;
        };
        match client.noop().await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("NOOP failed: {}", e);
                if e.is_connection_lost() {
                    self.client = None;
                }
                false
            }
        }
    }

    async fn change_directory(&mut self, path: &str) -> RemoteResult<String> {
        let r = self.client()?.cwd(path).await;
        self.observe(r)
    }

    async fn list_files(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let client = self.client()?;
        let target = if is_current_dir(path) {
            client.current_dir().to_string()
        } else {
            path.to_string()
        };
        let listed = client.list(&target).await;
        let (dir, raw) = self.observe(listed)?;

        let mut entries: Vec<RemoteEntry> = raw
            .into_iter()
            .map(|e| RemoteEntry {
                path: join_remote(&dir, &e.name),
                name: e.name,
                is_dir: e.is_dir,
                size: e.size,
                modified: e.modified,
                modified_unix: e.modified_unix,
            })
            .collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn download_file(
        &mut self,
        remote: &str,
        local: &Path,
        ctl: &TransferControl,
    ) -> RemoteResult<u64> {
        let r = self.client()?.download(remote, local, ctl).await;
        self.observe(r)
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote: &str,
        ctl: &TransferControl,
    ) -> RemoteResult<u64> {
        let r = self.client()?.upload(local, remote, ctl).await;
        self.observe(r)
    }

    async fn delete_file(&mut self, path: &str) -> RemoteResult<()> {
        let r = self.client()?.delete(path).await;
        self.observe(r)
    }

    async fn delete_folder(&mut self, path: &str) -> RemoteResult<()> {
        let r = self.client()?.rmdir(path).await;
        self.observe(r)
    }

    async fn create_folder(&mut self, path: &str) -> RemoteResult<()> {
        let r = self.client()?.mkdir(path).await;
        self.observe(r)
    }

    async fn rename_file(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        let r = self.client()?.rename(from, to).await;
        self.observe(r)
    }

    async fn disconnect(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.quit().await;
            log::info!("Disconnected from {}", self.config.address());
        }
    }
}
