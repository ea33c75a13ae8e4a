//! The capability every backend implements.
//!
//! Callers choose a backend once, when the session is opened, and then
//! only talk to `dyn RemoteSession`; nothing downstream branches on which
//! protocol is underneath.

use crate::control::TransferControl;
use crate::error::{RemoteErrorKind, RemoteResult};
use crate::types::{ConnectionConfig, Protocol, RemoteEntry};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait RemoteSession: Send {
    fn protocol(&self) -> Protocol;

    fn config(&self) -> &ConnectionConfig;

    /// Establish the connection and authenticate. The `Ok` value is the
    /// human-readable status line (server banner, welcome text).
    async fn connect(&mut self) -> RemoteResult<String>;

    /// Best-effort working directory; `"."` when unknown.
    async fn current_directory(&mut self) -> String;

    /// Lightweight round-trip check. Never errors; a dead link is `false`.
    async fn is_connected(&mut self) -> bool;

    async fn change_directory(&mut self, path: &str) -> RemoteResult<String>;

    /// Fresh listing of `path` (`""`/`"."` = working directory), sorted
    /// directories first then by name, case-insensitively.
    async fn list_files(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>>;

    /// Returns the number of bytes written to `local`. Missing local
    /// parent directories are created.
    async fn download_file(
        &mut self,
        remote: &str,
        local: &Path,
        ctl: &TransferControl,
    ) -> RemoteResult<u64>;

    /// Returns the number of bytes sent. The remote parent directory must
    /// already exist.
    async fn upload_file(
        &mut self,
        local: &Path,
        remote: &str,
        ctl: &TransferControl,
    ) -> RemoteResult<u64>;

    async fn delete_file(&mut self, path: &str) -> RemoteResult<()>;

    /// Removes an empty directory.
    async fn delete_folder(&mut self, path: &str) -> RemoteResult<()>;

    async fn create_folder(&mut self, path: &str) -> RemoteResult<()>;

    async fn rename_file(&mut self, from: &str, to: &str) -> RemoteResult<()>;

    /// Close the connection, absorbing every error. Safe to call twice.
    async fn disconnect(&mut self);

    /// Lists `path`, falling back to the working directory when `path`
    /// does not exist (the browsing panels rely on this).
    async fn list_files_or_current(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        match self.list_files(path).await {
            Err(e) if e.kind == RemoteErrorKind::NotFound => {
                log::warn!("{}: {}, showing working directory instead", path, e.message);
                self.list_files(".").await
            }
            other => other,
        }
    }
}
