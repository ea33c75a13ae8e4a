//! Executes one [`TransferItem`] on a session it has exclusive use of.
//!
//! Before moving bytes the engine checks the connection and reconnects
//! once if it went away. Throttling, progress and cancellation all live
//! in the [`TransferControl`] handed to the backend.

use fftp_core::{ActivityLog, RemoteResult, RemoteSession, TransferControl, TransferDirection, TransferItem};

/// Engine to owner notifications.
pub trait EngineObserver: Send + Sync {
    /// The connection is ready and bytes are about to move.
    fn on_transferring(&self, item: &TransferItem);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl EngineObserver for NoopObserver {
    fn on_transferring(&self, _item: &TransferItem) {}
}

pub struct TransferEngine {
    ctl: TransferControl,
    activity: Option<ActivityLog>,
}

impl TransferEngine {
    pub fn new(ctl: TransferControl) -> Self {
        Self { ctl, activity: None }
    }

    pub fn with_activity(mut self, log: ActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn control(&self) -> &TransferControl {
        &self.ctl
    }

    /// Run `item` to completion. Returns the number of bytes moved.
    pub async fn execute(
        &self,
        session: &mut dyn RemoteSession,
        item: &TransferItem,
        observer: &dyn EngineObserver,
    ) -> RemoteResult<u64> {
        self.ctl.check_cancelled()?;
        self.ensure_connected(session).await?;
        self.ctl.check_cancelled()?;

        if item.size > 0 {
            self.ctl.set_total(item.size);
        }
        self.ctl.start();
        observer.on_transferring(item);
        log::debug!(
            "{} {} <-> {}",
            item.direction.label(),
            item.local_path.display(),
            item.remote_path
        );

        let moved = match item.direction {
            TransferDirection::Upload => {
                session
                    .upload_file(&item.local_path, &item.remote_path, &self.ctl)
                    .await?
            }
            TransferDirection::Download => {
                session
                    .download_file(&item.remote_path, &item.local_path, &self.ctl)
                    .await?
            }
        };
        self.ctl.check_cancelled()?;
        Ok(moved)
    }

    async fn ensure_connected(&self, session: &mut dyn RemoteSession) -> RemoteResult<()> {
        if session.is_connected().await {
            return Ok(());
        }
        let msg = "Connection lost, attempting to reconnect...";
        match &self.activity {
            Some(activity) => activity.warning(msg),
            None => log::warn!("{}", msg),
        }
        session.connect().await?;
        if let Some(activity) = &self.activity {
            activity.info(format!("Reconnected to {}", session.config().address()));
        }
        Ok(())
    }
}
