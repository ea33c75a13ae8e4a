//! Recursive directory upload.

use crate::queue::TransferQueue;
use fftp_core::listing::join_remote;
use fftp_core::{RemoteError, RemoteResult, RemoteSession, TransferDirection, TransferId, TransferItem};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

struct Plan {
    dirs: Vec<String>,
    files: Vec<(PathBuf, String, u64)>,
}

impl TransferQueue {
    /// Mirror `local_root` under `remote_parent`: create the root folder
    /// and every subfolder on the server, then queue one upload per file.
    /// Nothing is queued when a folder cannot be created.
    pub async fn upload_directory(
        &self,
        session_id: &str,
        local_root: &Path,
        remote_parent: &str,
    ) -> RemoteResult<Vec<TransferId>> {
        let root_name = local_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RemoteError::local_io(format!("{} has no folder name", local_root.display())))?;
        if !local_root.is_dir() {
            return Err(RemoteError::local_io(format!("{} is not a folder", local_root.display())));
        }
        let remote_root = join_remote(remote_parent, &root_name);
        let plan = scan(local_root, &remote_root)?;

        {
            let mut lease = self.shared.pool.acquire(session_id).await?;
            if !lease.is_connected().await {
                lease.connect().await?;
            }
            for dir in std::iter::once(&remote_root).chain(plan.dirs.iter()) {
                ensure_remote_dir(&mut *lease, dir).await.map_err(|e| {
                    self.shared
                        .activity
                        .error(format!("Folder upload aborted, cannot create {}: {}", dir, e));
                    e.with_context(format!("create folder {}", dir))
                })?;
            }
        }

        let ids: Vec<TransferId> = plan
            .files
            .into_iter()
            .map(|(local, remote, size)| {
                self.enqueue(TransferItem::new(session_id, TransferDirection::Upload, local, remote, size))
            })
            .collect();
        self.shared.activity.info(format!(
            "Queued {} file(s) from {}",
            ids.len(),
            local_root.display()
        ));
        Ok(ids)
    }
}

fn scan(local_root: &Path, remote_root: &str) -> RemoteResult<Plan> {
    let mut plan = Plan {
        dirs: Vec::new(),
        files: Vec::new(),
    };
    for entry in WalkDir::new(local_root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| RemoteError::local_io(format!("Cannot read {}: {}", local_root.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(local_root)
            .map_err(|e| RemoteError::local_io(e.to_string()))?;
        let remote = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .fold(remote_root.to_string(), |acc, seg| join_remote(&acc, &seg));

        let kind = entry.file_type();
        if kind.is_dir() {
            plan.dirs.push(remote);
        } else if kind.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            plan.files.push((entry.into_path(), remote, size));
        } else {
            log::debug!("skipping {} (not a regular file)", entry.path().display());
        }
    }
    Ok(plan)
}

/// Create `path`, accepting a folder that already exists.
async fn ensure_remote_dir(session: &mut dyn RemoteSession, path: &str) -> RemoteResult<()> {
    match session.create_folder(path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if session.list_files(path).await.is_ok() {
                log::debug!("{} already exists", path);
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
