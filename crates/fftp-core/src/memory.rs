//! In-memory backend for tests.
//!
//! A [`MemoryServer`] is a shared fake filesystem; every [`MemorySession`]
//! opened against it sees the same tree. The server can delay chunks,
//! drop all links, reject logins, and records how many transfers ran at
//! the same time.

use crate::control::TransferControl;
use crate::error::{RemoteError, RemoteResult};
use crate::listing::{normalize_remote, remote_file_name, remote_parent, sort_entries};
use crate::session::RemoteSession;
use crate::types::{ConnectionConfig, Protocol, RemoteEntry};
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
enum Node {
    Dir { mtime: i64 },
    File { data: Vec<u8>, mtime: i64 },
}

#[derive(Debug)]
struct ServerState {
    nodes: BTreeMap<String, Node>,
    reject_auth: bool,
    chunk_delay: Duration,
    fail_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    generation: Arc<AtomicU64>,
    connects: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<String>>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir { mtime: now() });
        Self {
            state: Arc::new(Mutex::new(ServerState {
                nodes,
                reject_auth: false,
                chunk_delay: Duration::ZERO,
                fail_paths: Vec::new(),
            })),
            generation: Arc::new(AtomicU64::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// New session bound to this server, not yet connected.
    pub fn session(&self, config: ConnectionConfig) -> MemorySession {
        MemorySession {
            server: self.clone(),
            config,
            connected: false,
            generation: 0,
            cwd: "/".to_string(),
            chunk_size: 4,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.lock().reject_auth = reject;
    }

    /// Pause after every chunk, to keep transfers in flight long enough
    /// to observe them.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.lock().chunk_delay = delay;
    }

    /// Transfers touching `path` fail with a permission error.
    pub fn fail_path(&self, path: &str) {
        self.lock().fail_paths.push(path.to_string());
    }

    /// Silently kill every open session; they notice on their next liveness check.
    pub fn drop_links(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Highest number of transfers observed moving bytes at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Names of transferred files in the order their first byte moved.
    pub fn start_order(&self) -> Vec<String> {
        self.started.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn mkdir_all(&self, path: &str) {
        let path = normalize_remote("/", path);
        let mut st = self.lock();
        let mut cur = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            cur = format!("{}/{}", cur, seg);
            st.nodes
                .entry(cur.clone())
                .or_insert(Node::Dir { mtime: now() });
        }
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.put_file_with_mtime(path, data, now());
    }

    pub fn put_file_with_mtime(&self, path: &str, data: &[u8], mtime: i64) {
        let path = normalize_remote("/", path);
        self.mkdir_all(&remote_parent(&path));
        self.lock().nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&normalize_remote("/", path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(&normalize_remote("/", path))
    }

    fn begin_transfer(&self, name: &str) -> FlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut s) = self.started.lock() {
            s.push(name.to_string());
        }
        FlightGuard {
            counter: self.in_flight.clone(),
        }
    }
}

struct FlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn format_mtime(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

pub struct MemorySession {
    server: MemoryServer,
    config: ConnectionConfig,
    connected: bool,
    generation: u64,
    cwd: String,
    chunk_size: usize,
}

impl MemorySession {
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn ensure(&self) -> RemoteResult<()> {
        if self.connected && self.generation == self.server.generation.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::not_connected())
        }
    }

    fn resolve(&self, path: &str) -> String {
        normalize_remote(&self.cwd, path)
    }

    fn check_fail(&self, path: &str) -> RemoteResult<()> {
        if self.server.lock().fail_paths.iter().any(|p| p == path) {
            Err(RemoteError::permission_denied(format!("{}: permission denied", path)))
        } else {
            Ok(())
        }
    }

    fn require_dir(&self, path: &str) -> RemoteResult<()> {
        match self.server.lock().nodes.get(path) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(RemoteError::protocol(format!("{}: not a directory", path))),
            None => Err(RemoteError::not_found(format!("{}: no such directory", path))),
        }
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn connect(&mut self) -> RemoteResult<String> {
        if self.server.lock().reject_auth {
            return Err(RemoteError::auth(format!(
                "Authentication failed for {}",
                self.config.username
            ))
            .with_context(self.config.address()));
        }
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        self.generation = self.server.generation.load(Ordering::SeqCst);
        self.connected = true;
        if let Some(dir) = self.config.initial_directory.clone() {
            let dir = self.resolve(&dir);
            if self.require_dir(&dir).is_ok() {
                self.cwd = dir;
            }
        }
        Ok(format!("Connected to {}", self.config.address()))
    }

    async fn current_directory(&mut self) -> String {
        if self.ensure().is_err() {
            return ".".to_string();
        }
        self.cwd.clone()
    }

    async fn is_connected(&mut self) -> bool {
        self.ensure().is_ok()
    }

    async fn change_directory(&mut self, path: &str) -> RemoteResult<String> {
        self.ensure()?;
        let dir = self.resolve(path);
        self.require_dir(&dir)?;
        self.cwd = dir.clone();
        Ok(dir)
    }

    async fn list_files(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.ensure()?;
        let dir = self.resolve(path);
        self.require_dir(&dir)?;
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let mut out: Vec<RemoteEntry> = self
            .server
            .lock()
            .nodes
            .iter()
            .filter(|(p, _)| {
                p.starts_with(&prefix) && p.len() > prefix.len() && !p[prefix.len()..].contains('/')
            })
            .map(|(p, node)| {
                let (is_dir, size, mtime) = match node {
                    Node::Dir { mtime } => (true, 0, *mtime),
                    Node::File { data, mtime } => (false, data.len() as u64, *mtime),
                };
                RemoteEntry {
                    name: remote_file_name(p).to_string(),
                    path: p.clone(),
                    is_dir,
                    size,
                    modified: format_mtime(mtime),
                    modified_unix: Some(mtime),
                }
            })
            .collect();
        sort_entries(&mut out);
        Ok(out)
    }

    async fn download_file(
        &mut self,
        remote: &str,
        local: &Path,
        ctl: &TransferControl,
    ) -> RemoteResult<u64> {
        self.ensure()?;
        let path = self.resolve(remote);
        self.check_fail(&path)?;
        let (data, delay) = {
            let st = self.server.lock();
            match st.nodes.get(&path) {
                Some(Node::File { data, .. }) => (data.clone(), st.chunk_delay),
                Some(Node::Dir { .. }) => {
                    return Err(RemoteError::protocol(format!("{}: is a directory", path)))
                }
                None => return Err(RemoteError::not_found(format!("{}: no such file", path))),
            }
        };
        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        ctl.set_total(data.len() as u64);
        let _flight = self.server.begin_transfer(remote_file_name(&path));
        let mut file = tokio::fs::File::create(local).await?;
        for chunk in data.chunks(self.chunk_size) {
            ctl.check_cancelled()?;
            self.ensure()?;
            file.write_all(chunk).await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ctl.advance(chunk.len() as u64).await?;
        }
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote: &str,
        ctl: &TransferControl,
    ) -> RemoteResult<u64> {
        self.ensure()?;
        let path = self.resolve(remote);
        self.check_fail(&path)?;
        self.require_dir(&remote_parent(&path))?;
        let data = tokio::fs::read(local).await.map_err(|e| {
            RemoteError::local_io(format!("Cannot read {}: {}", local.display(), e))
        })?;
        let delay = self.server.lock().chunk_delay;
        ctl.set_total(data.len() as u64);
        let _flight = self.server.begin_transfer(remote_file_name(&path));
        let mut received = Vec::with_capacity(data.len());
        for chunk in data.chunks(self.chunk_size) {
            ctl.check_cancelled()?;
            self.ensure()?;
            received.extend_from_slice(chunk);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ctl.advance(chunk.len() as u64).await?;
        }
        let len = received.len() as u64;
        self.server.lock().nodes.insert(
            path,
            Node::File {
                data: received,
                mtime: now(),
            },
        );
        Ok(len)
    }

    async fn delete_file(&mut self, path: &str) -> RemoteResult<()> {
        self.ensure()?;
        let path = self.resolve(path);
        let mut st = self.server.lock();
        let is_dir = match st.nodes.get(&path) {
            Some(node) => matches!(node, Node::Dir { .. }),
            None => return Err(RemoteError::not_found(format!("{}: no such file", path))),
        };
        if is_dir {
            return Err(RemoteError::protocol(format!("{}: is a directory", path)));
        }
        st.nodes.remove(&path);
        Ok(())
    }

    async fn delete_folder(&mut self, path: &str) -> RemoteResult<()> {
        self.ensure()?;
        let path = self.resolve(path);
        self.require_dir(&path)?;
        let prefix = format!("{}/", path);
        let mut st = self.server.lock();
        if path == "/" || st.nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(RemoteError::protocol(format!("{}: directory not empty", path)));
        }
        st.nodes.remove(&path);
        Ok(())
    }

    async fn create_folder(&mut self, path: &str) -> RemoteResult<()> {
        self.ensure()?;
        let path = self.resolve(path);
        self.require_dir(&remote_parent(&path))?;
        let mut st = self.server.lock();
        if st.nodes.contains_key(&path) {
            return Err(RemoteError::protocol(format!("{}: already exists", path)));
        }
        st.nodes.insert(path, Node::Dir { mtime: now() });
        Ok(())
    }

    async fn rename_file(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        self.ensure()?;
        let from = self.resolve(from);
        let to = self.resolve(to);
        self.require_dir(&remote_parent(&to))?;
        let mut st = self.server.lock();
        if !st.nodes.contains_key(&from) {
            return Err(RemoteError::not_found(format!("{}: no such file", from)));
        }
        let prefix = format!("{}/", from);
        let moved: Vec<String> = st
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = st.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                st.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ConnectionConfig {
        ConnectionConfig::new(Protocol::Sftp, "mem", "u")
    }

    #[tokio::test]
    async fn listing_is_sorted_and_dot_equals_empty() {
        let server = MemoryServer::new();
        server.put_file("/b.txt", b"bb");
        server.put_file("/A.txt", b"a");
        server.mkdir_all("/zdir");
        let mut s = server.session(cfg());
        s.connect().await.unwrap();
        let a = s.list_files(".").await.unwrap();
        let b = s.list_files("").await.unwrap();
        assert_eq!(a, b);
        let names: Vec<_> = a.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["zdir", "A.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn dropped_link_is_noticed() {
        let server = MemoryServer::new();
        let mut s = server.session(cfg());
        s.connect().await.unwrap();
        assert!(s.is_connected().await);
        server.drop_links();
        assert!(!s.is_connected().await);
        assert_eq!(s.current_directory().await, ".");
    }

    #[tokio::test]
    async fn upload_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("x.txt");
        std::fs::write(&local, b"x").unwrap();
        let server = MemoryServer::new();
        let mut s = server.session(cfg());
        s.connect().await.unwrap();
        let err = s
            .upload_file(&local, "/nope/x.txt", &TransferControl::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::RemoteErrorKind::NotFound);
        assert!(!server.exists("/nope"));
    }
}
