//! High-level orchestrator: owns the trust store, the connection pool and
//! the transfer queue, and exposes the operations a UI command layer
//! delegates to.

use crate::backend::{connection_report, open_session, validate, BackendFactory};
use crate::settings::AppSettings;
use fftp_core::{ActivityLog, ConnectionConfig, RemoteEntry, RemoteResult, RemoteSession, SessionId, TransferId};
use fftp_sftp::HostTrustStore;
use fftp_transfer::{ConflictPrompt, SessionFactory, SessionLease, SessionPool, TransferQueue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared handle for a command layer.
pub type TransferServiceState = Arc<Mutex<TransferService>>;

/// How long a liveness check waits for a connection that is busy with a
/// transfer before reporting it alive.
const BUSY_WAIT: Duration = Duration::from_secs(2);

pub struct TransferService {
    settings: AppSettings,
    trust: Arc<HostTrustStore>,
    queue: TransferQueue,
    activity: ActivityLog,
    prompt: Option<Arc<dyn ConflictPrompt>>,
}

impl TransferService {
    /// Build from `settings`, loading the persisted trust store. Without a
    /// home directory the store lives in memory only.
    pub fn new(settings: AppSettings) -> RemoteResult<Self> {
        let trust = match settings.trust_store_path() {
            Some(path) => HostTrustStore::load(path)?,
            None => {
                log::warn!("No home directory; host keys will not be remembered");
                HostTrustStore::in_memory()
            }
        };
        Ok(Self::with_parts(settings, Arc::new(trust), ActivityLog::new()))
    }

    pub fn with_parts(settings: AppSettings, trust: Arc<HostTrustStore>, activity: ActivityLog) -> Self {
        let pool = Arc::new(SessionPool::new());
        let queue = TransferQueue::with_activity(pool, settings.transfers.queue_config(), activity.clone());
        Self {
            settings,
            trust,
            queue,
            activity,
            prompt: None,
        }
    }

    pub fn into_state(self) -> TransferServiceState {
        Arc::new(Mutex::new(self))
    }

    /// Who answers the `ask` conflict policy. Without one, `ask` overwrites.
    pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn trust(&self) -> &Arc<HostTrustStore> {
        &self.trust
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    fn pool(&self) -> &Arc<SessionPool> {
        self.queue.pool()
    }

    // ─── Connection lifecycle ────────────────────────────────────────

    /// Open, authenticate and register a session. Returns its id and the
    /// server's status line.
    pub async fn connect(&self, config: ConnectionConfig) -> RemoteResult<(SessionId, String)> {
        if let Err(e) = validate(&config) {
            self.activity.error(connection_report(&config, &e));
            return Err(e);
        }
        let chunk = self.settings.transfers.chunk_size;
        let session = open_session(config, self.trust.clone(), chunk);
        let factory: Arc<dyn SessionFactory> = Arc::new(BackendFactory::new(self.trust.clone(), chunk));
        self.attach(session, Some(factory)).await
    }

    /// Connect an already built session and register it. With a factory,
    /// the session may grow to `connectionsPerSession` connections.
    pub async fn attach(
        &self,
        mut session: Box<dyn RemoteSession>,
        factory: Option<Arc<dyn SessionFactory>>,
    ) -> RemoteResult<(SessionId, String)> {
        let config = session.config().clone();
        self.activity
            .info(format!("Connecting to {} ({})...", config.address(), config.protocol.label()));
        let message = match session.connect().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(host = %config.address(), kind = ?e.kind, "connect failed");
                self.activity.error(connection_report(&config, &e));
                return Err(e);
            }
        };

        let id: SessionId = uuid::Uuid::new_v4().to_string();
        match factory {
            Some(f) => {
                let max = self.settings.transfers.connections_per_session;
                self.pool().insert_with_factory(id.clone(), session, f, max);
            }
            None => self.pool().insert(id.clone(), session),
        }
        tracing::info!(session = %id, host = %config.address(), "session registered");
        self.activity.success(format!("Connected to {}", config.address()));
        Ok((id, message))
    }

    /// Cancel the session's transfers and close its connections. Returns
    /// `false` for an unknown session.
    pub async fn disconnect(&self, session_id: &str) -> bool {
        for item in self.queue.active_items() {
            if item.session_id == session_id {
                self.queue.cancel(&item.id);
            }
        }
        let removed = self.pool().remove(session_id).await;
        if removed {
            self.activity.info("Disconnected");
        }
        removed
    }

    pub async fn shutdown(&self) {
        self.queue.cancel_all();
        self.pool().disconnect_all().await;
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.pool().ids()
    }

    /// Check the session. A connection busy with a transfer counts as
    /// alive.
    pub async fn is_connected(&self, session_id: &str) -> bool {
        if !self.pool().contains(session_id) {
            return false;
        }
        match tokio::time::timeout(BUSY_WAIT, self.pool().acquire(session_id)).await {
            Ok(Ok(mut lease)) => lease.is_connected().await,
            Ok(Err(_)) => false,
            Err(_) => true,
        }
    }

    async fn lease(&self, session_id: &str) -> RemoteResult<SessionLease> {
        self.pool().acquire(session_id).await
    }

    // ─── Browsing and file operations ────────────────────────────────

    /// Listing of `path`, or of the working directory when `path` is gone.
    pub async fn list_files(&self, session_id: &str, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.lease(session_id).await?.list_files_or_current(path).await
    }

    pub async fn change_directory(&self, session_id: &str, path: &str) -> RemoteResult<String> {
        self.lease(session_id).await?.change_directory(path).await
    }

    pub async fn current_directory(&self, session_id: &str) -> RemoteResult<String> {
        Ok(self.lease(session_id).await?.current_directory().await)
    }

    pub async fn create_folder(&self, session_id: &str, path: &str) -> RemoteResult<()> {
        self.lease(session_id).await?.create_folder(path).await?;
        self.activity.info(format!("Created {}", path));
        Ok(())
    }

    pub async fn delete_file(&self, session_id: &str, path: &str) -> RemoteResult<()> {
        self.lease(session_id).await?.delete_file(path).await?;
        self.activity.info(format!("Deleted {}", path));
        Ok(())
    }

    pub async fn delete_folder(&self, session_id: &str, path: &str) -> RemoteResult<()> {
        self.lease(session_id).await?.delete_folder(path).await?;
        self.activity.info(format!("Deleted {}", path));
        Ok(())
    }

    pub async fn rename(&self, session_id: &str, from: &str, to: &str) -> RemoteResult<()> {
        self.lease(session_id).await?.rename_file(from, to).await?;
        self.activity.info(format!("Renamed {} to {}", from, to));
        Ok(())
    }

    // ─── Transfers ───────────────────────────────────────────────────

    /// Queue an upload of `local` into `remote_dir`, applying the
    /// configured conflict policy against a fresh listing of `remote_dir`.
    /// `Ok(None)` means the file was skipped.
    pub async fn upload(
        &self,
        session_id: &str,
        local: &Path,
        remote_dir: &str,
    ) -> RemoteResult<Option<TransferId>> {
        let listing = self.lease(session_id).await?.list_files(remote_dir).await?;
        self.queue
            .enqueue_upload_resolved(
                session_id,
                local,
                remote_dir,
                &listing,
                self.settings.transfers.conflict_policy,
                self.prompt.as_deref(),
            )
            .await
    }

    /// Queue a download of `entry` into `local_dir`.
    pub fn download(&self, session_id: &str, entry: &RemoteEntry, local_dir: &Path) -> TransferId {
        let local: PathBuf = local_dir.join(&entry.name);
        self.queue
            .enqueue_download(session_id, entry.path.clone(), local, entry.size)
    }

    pub async fn upload_directory(
        &self,
        session_id: &str,
        local_root: &Path,
        remote_parent: &str,
    ) -> RemoteResult<Vec<TransferId>> {
        self.queue.upload_directory(session_id, local_root, remote_parent).await
    }

    pub fn set_speed_limit(&mut self, bytes_per_sec: u64) {
        self.settings.transfers.speed_limit_bytes_per_sec = bytes_per_sec;
        self.queue.set_speed_limit(bytes_per_sec);
    }

    pub fn set_max_concurrent(&mut self, n: usize) {
        self.settings.transfers.max_concurrent_transfers = n.max(1);
        self.queue.set_max_concurrent(n);
    }
}
