//! Transfer queue: owns every [`TransferItem`], bounds how many run at
//! once, and reports what happens on a broadcast channel.
//!
//! Three collections: `active` (queued and running items, FIFO),
//! `completed` and `failed` (cancelled items land in `failed` with status
//! `Cancelled`). Dispatch is greedy: whenever an item is enqueued or one
//! finishes, the first `Queued` items are promoted until the concurrency
//! limit is reached. An item is promoted only once a connection slot of
//! its session is reserved, so a busy session never holds back items of
//! other sessions queued behind it. Each promoted item runs on its own
//! tokio task with a pooled connection it holds exclusively.
//!
//! All state changes go through the queue's mutex; it is never held
//! across an await.

use crate::conflict::{names_of, ConflictPolicy, ConflictPrompt, ConflictResolver, LocalStat};
use crate::engine::{EngineObserver, TransferEngine};
use crate::pool::{Reservation, SessionPool};
use fftp_core::listing::join_remote;
use fftp_core::{
    ActivityLog, RemoteEntry, RemoteError, RemoteResult, SessionId, TransferControl, TransferDirection,
    TransferId, TransferItem, TransferStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Bytes per second for each transfer; 0 = unlimited.
    #[serde(default)]
    pub speed_limit_bytes_per_sec: u64,
}

fn default_max_concurrent() -> usize {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            speed_limit_bytes_per_sec: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub id: TransferId,
    pub transferred: u64,
    pub total: u64,
    /// Average since the item started, bytes per second.
    pub speed_bps: u64,
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    Status {
        id: TransferId,
        status: TransferStatus,
        error: Option<String>,
    },
    Progress(ProgressSnapshot),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: usize,
    /// Items in `Starting` or `Transferring`.
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    active: VecDeque<TransferItem>,
    completed: Vec<TransferItem>,
    failed: Vec<TransferItem>,
    controls: HashMap<TransferId, TransferControl>,
    config: QueueConfig,
    running: usize,
    /// A release watcher is waiting to retry passed-over items.
    watching: bool,
}

pub(crate) struct Shared {
    state: Mutex<QueueState>,
    pub(crate) pool: Arc<SessionPool>,
    events: broadcast::Sender<TransferEvent>,
    idle: watch::Sender<bool>,
    pub(crate) activity: ActivityLog,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: TransferEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_idle(&self, st: &QueueState) {
        self.idle.send_replace(st.active.is_empty());
    }
}

#[derive(Clone)]
pub struct TransferQueue {
    pub(crate) shared: Arc<Shared>,
}

impl TransferQueue {
    pub fn new(pool: Arc<SessionPool>, config: QueueConfig) -> Self {
        Self::with_activity(pool, config, ActivityLog::default())
    }

    pub fn with_activity(pool: Arc<SessionPool>, config: QueueConfig, activity: ActivityLog) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (idle, _) = watch::channel(true);
        let state = QueueState {
            config: QueueConfig {
                max_concurrent: config.max_concurrent.max(1),
                ..config
            },
            ..QueueState::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                pool,
                events,
                idle,
                activity,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.shared.pool
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.shared.activity
    }

    // ─── Enqueue ─────────────────────────────────────────────────────

    /// Add `item` at the back of the queue. Must be called from within a
    /// tokio runtime; promoted items are spawned onto it.
    pub fn enqueue(&self, mut item: TransferItem) -> TransferId {
        item.status = TransferStatus::Queued;
        item.transferred = 0;
        item.error = None;
        let id = item.id.clone();
        log::info!("Queued {} of {}", item.direction.label(), item.display_name());
        {
            let mut st = self.shared.state();
            st.active.push_back(item);
            self.shared.publish_idle(&st);
        }
        self.shared.emit(TransferEvent::Status {
            id: id.clone(),
            status: TransferStatus::Queued,
            error: None,
        });
        self.dispatch();
        id
    }

    pub fn enqueue_upload(
        &self,
        session_id: &str,
        local: impl Into<PathBuf>,
        remote: impl Into<String>,
    ) -> RemoteResult<TransferId> {
        let local = local.into();
        let stat = LocalStat::from_path(&local)?;
        Ok(self.enqueue(TransferItem::new(
            session_id,
            TransferDirection::Upload,
            local,
            remote,
            stat.size,
        )))
    }

    pub fn enqueue_download(
        &self,
        session_id: &str,
        remote: impl Into<String>,
        local: impl Into<PathBuf>,
        size: u64,
    ) -> TransferId {
        self.enqueue(TransferItem::new(
            session_id,
            TransferDirection::Download,
            local,
            remote,
            size,
        ))
    }

    /// Upload `local` into `remote_dir`, consulting the conflict policy
    /// against `listing` (the caller's snapshot of `remote_dir`).
    /// `Ok(None)` means the file was skipped. A folder of the same name is
    /// a conflict error whatever the policy.
    pub async fn enqueue_upload_resolved(
        &self,
        session_id: &str,
        local: &Path,
        remote_dir: &str,
        listing: &[RemoteEntry],
        policy: ConflictPolicy,
        prompt: Option<&dyn ConflictPrompt>,
    ) -> RemoteResult<Option<TransferId>> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RemoteError::local_io(format!("{} has no file name", local.display())))?;
        let stat = LocalStat::from_path(local)?;
        let existing = listing.iter().find(|e| e.name == name);
        if let Some(dir) = existing.filter(|e| e.is_dir) {
            // no policy can put a file where a folder is
            self.shared
                .activity
                .error(format!("Cannot upload {}: a folder with that name exists", name));
            return Err(RemoteError::conflict(format!("{} is a folder on the server", name)).with_context(dir.path.clone()));
        }
        let taken = names_of(listing);

        let resolver = ConflictResolver::default();
        let mut decision = resolver.resolve(&stat, existing, policy, &taken);
        if let Some(remote) = existing {
            decision = resolver.settle(decision, local, remote, &taken, prompt).await;
        }

        let Some(target) = decision.target_name(&name) else {
            self.shared.activity.info(format!("Skipped {} (already on the server)", name));
            return Ok(None);
        };
        if target != name {
            self.shared.activity.info(format!("Uploading {} as {}", name, target));
        }
        let item = TransferItem::new(
            session_id,
            TransferDirection::Upload,
            local,
            join_remote(remote_dir, &target),
            stat.size,
        );
        Ok(Some(self.enqueue(item)))
    }

    // ─── Dispatch ────────────────────────────────────────────────────

    fn dispatch(&self) {
        if let Some(rx) = self.dispatch_inner(false) {
            let weak = Arc::downgrade(&self.shared);
            tokio::spawn(watch_releases(weak, rx));
        }
    }

    /// Promote `Queued` items in order while there is room. An item whose
    /// session has every connection busy is passed over so items of other
    /// sessions behind it can start. Returns a release receiver when a
    /// watcher should retry the passed-over items.
    fn dispatch_inner(&self, from_watcher: bool) -> Option<watch::Receiver<u64>> {
        // subscribe before reserving so no release is missed
        let releases = self.shared.pool.releases();
        let mut launch = Vec::new();
        let mut blocked = false;
        let resume = {
            let mut guard = self.shared.state();
            let st = &mut *guard;
            let mut saturated: HashSet<SessionId> = HashSet::new();
            let mut idx = 0;
            while st.running < st.config.max_concurrent && idx < st.active.len() {
                let item = &mut st.active[idx];
                idx += 1;
                if item.status != TransferStatus::Queued {
                    continue;
                }
                if saturated.contains(&item.session_id) {
                    blocked = true;
                    continue;
                }
                let Some(reservation) = self.shared.pool.try_reserve(&item.session_id) else {
                    saturated.insert(item.session_id.clone());
                    blocked = true;
                    continue;
                };
                item.transition(TransferStatus::Starting);
                let item = item.clone();
                st.running += 1;
                let ctl = self.control_for(&item, st.config.speed_limit_bytes_per_sec);
                st.controls.insert(item.id.clone(), ctl.clone());
                launch.push((item, ctl, reservation));
            }
            self.shared.publish_idle(st);

            let waiting = blocked && st.running < st.config.max_concurrent;
            if from_watcher {
                st.watching = waiting;
                waiting
            } else if waiting && !st.watching {
                st.watching = true;
                true
            } else {
                false
            }
        };

        for (item, ctl, reservation) in launch {
            self.shared.emit(TransferEvent::Status {
                id: item.id.clone(),
                status: TransferStatus::Starting,
                error: None,
            });
            let queue = self.clone();
            tokio::spawn(async move {
                let result = queue.execute(&item, &ctl, reservation).await;
                queue.finish(&item.id, result);
            });
        }
        resume.then_some(releases)
    }

    fn control_for(&self, item: &TransferItem, speed_limit: u64) -> TransferControl {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let id = item.id.clone();
        TransferControl::default()
            .with_speed_limit(speed_limit)
            .with_progress(Arc::new(move |ctl: &TransferControl| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let (done, total) = (ctl.transferred(), ctl.total());
                // measured from when bytes started moving, not from dispatch
                let elapsed = ctl.elapsed().as_secs_f64();
                let speed_bps = if elapsed > 0.0 { (done as f64 / elapsed) as u64 } else { 0 };
                let eta_secs = (speed_bps > 0 && total > done).then(|| (total - done) / speed_bps);
                if let Some(item) = shared.state().active.iter_mut().find(|i| i.id == id) {
                    item.transferred = done;
                    if total > 0 {
                        item.size = total;
                    }
                }
                shared.emit(TransferEvent::Progress(ProgressSnapshot {
                    id: id.clone(),
                    transferred: done,
                    total,
                    speed_bps,
                    eta_secs,
                }));
            }))
    }

    async fn execute(
        &self,
        item: &TransferItem,
        ctl: &TransferControl,
        reservation: RemoteResult<Reservation>,
    ) -> RemoteResult<u64> {
        let reservation = reservation?;
        let mut lease = tokio::select! {
            biased;
            _ = ctl.token().cancelled() => return Err(RemoteError::cancelled()),
            lease = reservation.lease() => lease?,
        };
        let engine = TransferEngine::new(ctl.clone()).with_activity(self.shared.activity.clone());
        engine
            .execute(&mut *lease, item, self)
            .await
            // a cancelled transfer may surface as whatever error the
            // interrupted operation produced
            .map_err(|e| if ctl.is_cancelled() { RemoteError::cancelled() } else { e })
    }

    fn finish(&self, id: &str, result: RemoteResult<u64>) {
        let finished = {
            let mut st = self.shared.state();
            st.running = st.running.saturating_sub(1);
            st.controls.remove(id);
            let item = st
                .active
                .iter()
                .position(|i| i.id == id)
                .and_then(|pos| st.active.remove(pos));
            item.map(|mut item| {
                match result {
                    Ok(n) => {
                        item.transferred = n;
                        if item.size == 0 {
                            item.size = n;
                        }
                        if item.status == TransferStatus::Starting {
                            item.transition(TransferStatus::Transferring);
                        }
                        item.transition(TransferStatus::Completed);
                        st.completed.push(item.clone());
                    }
                    Err(e) if e.is_cancelled() => {
                        item.transition(TransferStatus::Cancelled);
                        item.error = Some("Cancelled".to_string());
                        st.failed.push(item.clone());
                    }
                    Err(e) => {
                        item.transition(TransferStatus::Failed);
                        item.error = Some(e.to_string());
                        st.failed.push(item.clone());
                    }
                }
                item
            })
        };

        if let Some(item) = finished {
            match item.status {
                TransferStatus::Completed => self
                    .shared
                    .activity
                    .success(format!("{} of {} completed", item.direction.label(), item.display_name())),
                TransferStatus::Cancelled => self
                    .shared
                    .activity
                    .warning(format!("{} of {} cancelled", item.direction.label(), item.display_name())),
                _ => self.shared.activity.error(format!(
                    "{} of {} failed: {}",
                    item.direction.label(),
                    item.display_name(),
                    item.error.as_deref().unwrap_or("unknown error")
                )),
            }
            self.shared.emit(TransferEvent::Status {
                id: item.id,
                status: item.status,
                error: item.error,
            });
        }
        self.dispatch();
    }

    // ─── Control ─────────────────────────────────────────────────────

    /// Cancel one item. A queued item goes straight to the failed
    /// collection without ever starting; a running one stops at its next
    /// chunk. Returns `false` for unknown or finished items.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = {
            let mut st = self.shared.state();
            if let Some(pos) = st
                .active
                .iter()
                .position(|i| i.id == id && i.status == TransferStatus::Queued)
            {
                let item = st.active.remove(pos).map(|mut item| {
                    item.transition(TransferStatus::Cancelled);
                    item.error = Some("Cancelled".to_string());
                    st.failed.push(item.clone());
                    item
                });
                self.shared.publish_idle(&st);
                item
            } else if let Some(ctl) = st.controls.get(id) {
                ctl.cancel();
                return true;
            } else {
                return false;
            }
        };
        if let Some(item) = cancelled {
            self.shared
                .activity
                .info(format!("Removed {} from the queue", item.display_name()));
            self.shared.emit(TransferEvent::Status {
                id: item.id,
                status: TransferStatus::Cancelled,
                error: item.error,
            });
        }
        true
    }

    /// Cancel everything queued or running.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TransferId> = self.shared.state().active.iter().map(|i| i.id.clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn clear_completed(&self) -> usize {
        let mut st = self.shared.state();
        let n = st.completed.len();
        st.completed.clear();
        n
    }

    pub fn clear_failed(&self) -> usize {
        let mut st = self.shared.state();
        let n = st.failed.len();
        st.failed.clear();
        n
    }

    /// Queue a fresh copy of failed item `id`. The failed record is
    /// removed; the new item gets a new id.
    pub fn resubmit_failed(&self, id: &str) -> Option<TransferId> {
        let old = {
            let mut st = self.shared.state();
            let pos = st.failed.iter().position(|i| i.id == id)?;
            st.failed.remove(pos)
        };
        let fresh = TransferItem::new(old.session_id, old.direction, old.local_path, old.remote_path, old.size);
        Some(self.enqueue(fresh))
    }

    pub fn set_max_concurrent(&self, n: usize) {
        self.shared.state().config.max_concurrent = n.max(1);
        self.dispatch();
    }

    /// Applies to running transfers too.
    pub fn set_speed_limit(&self, bytes_per_sec: u64) {
        let mut st = self.shared.state();
        st.config.speed_limit_bytes_per_sec = bytes_per_sec;
        for ctl in st.controls.values() {
            ctl.set_speed_limit(bytes_per_sec);
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.shared.state().config
    }

    // ─── Inspection ──────────────────────────────────────────────────

    pub fn status(&self) -> QueueStatus {
        let st = self.shared.state();
        QueueStatus {
            queued: st
                .active
                .iter()
                .filter(|i| i.status == TransferStatus::Queued)
                .count(),
            active: st.active.iter().filter(|i| i.status.is_running()).count(),
            completed: st.completed.len(),
            failed: st.failed.len(),
        }
    }

    /// Queued and running items, in queue order.
    pub fn active_items(&self) -> Vec<TransferItem> {
        self.shared.state().active.iter().cloned().collect()
    }

    pub fn completed(&self) -> Vec<TransferItem> {
        self.shared.state().completed.clone()
    }

    pub fn failed(&self) -> Vec<TransferItem> {
        self.shared.state().failed.clone()
    }

    pub fn item(&self, id: &str) -> Option<TransferItem> {
        let st = self.shared.state();
        st.active
            .iter()
            .chain(st.completed.iter())
            .chain(st.failed.iter())
            .find(|i| i.id == id)
            .cloned()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.state().active.is_empty()
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }
}

/// Re-run dispatch each time a pooled connection is handed back, until
/// nothing is left waiting on a saturated session.
async fn watch_releases(shared: Weak<Shared>, mut rx: watch::Receiver<u64>) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match (TransferQueue { shared }).dispatch_inner(true) {
            Some(next) => rx = next,
            None => return,
        }
    }
}

impl EngineObserver for TransferQueue {
    fn on_transferring(&self, item: &TransferItem) {
        let moved = self
            .shared
            .state()
            .active
            .iter_mut()
            .find(|i| i.id == item.id)
            .map(|i| i.transition(TransferStatus::Transferring))
            .unwrap_or(false);
        if moved {
            log::debug!("{} is transferring", item.display_name());
            self.shared.emit(TransferEvent::Status {
                id: item.id.clone(),
                status: TransferStatus::Transferring,
                error: None,
            });
        }
    }
}
