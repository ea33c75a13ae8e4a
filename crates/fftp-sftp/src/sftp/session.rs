//! `RemoteSession` over SSH file transfer (libssh2).
//!
//! libssh2 is blocking, so each operation clones the `ssh2::Session`
//! handle into a `spawn_blocking` task and opens a fresh SFTP channel
//! there. The session-wide libssh2 timeout bounds every individual call.
//! The working directory is tracked client-side as an absolute path
//! resolved with `realpath`.

use crate::sftp::trust::{host_entry_name, HostTrustStore};
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use fftp_core::listing::{is_current_dir, join_remote, normalize_remote, remote_parent, sort_entries};
use fftp_core::{
    ConnectionConfig, Protocol, RemoteEntry, RemoteError, RemoteErrorKind, RemoteResult, RemoteSession,
    TransferControl,
};
use ssh2::{ErrorCode, FileStat, HostKeyType, Session};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CHUNK: usize = 64 * 1024;

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_NO_SUCH_PATH: i32 = 10;

pub struct SecureSession {
    config: ConnectionConfig,
    trust: Arc<HostTrustStore>,
    session: Option<Session>,
    cwd: String,
    chunk_size: usize,
}

impl SecureSession {
    pub fn new(config: ConnectionConfig, trust: Arc<HostTrustStore>) -> Self {
        Self {
            config,
            trust,
            session: None,
            cwd: ".".to_string(),
            chunk_size: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn handle(&self) -> RemoteResult<Session> {
        self.session.clone().ok_or_else(RemoteError::not_connected)
    }

    fn resolve(&self, path: &str) -> String {
        if is_current_dir(path) {
            self.cwd.clone()
        } else {
            normalize_remote(&self.cwd, path)
        }
    }

    /// Run `op` against the live session on the blocking pool.
    async fn run<T, F>(&mut self, what: &str, op: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> RemoteResult<T> + Send + 'static,
    {
        let session = self.handle()?;
        let result = tokio::task::spawn_blocking(move || op(session))
            .await
            .map_err(|e| RemoteError::protocol(format!("{} task failed: {}", what, e)))
            .and_then(|r| r);
        if let Err(e) = &result {
            if e.kind == RemoteErrorKind::Network {
                log::warn!("{}: connection lost during {}: {}", self.config.address(), what, e);
                self.session = None;
            }
        }
        result
    }
}

// ─── Connect ─────────────────────────────────────────────────────────

struct Established {
    session: Session,
    home: String,
    banner: Option<String>,
    auth_method: &'static str,
}

fn establish(config: &ConnectionConfig, trust: &HostTrustStore) -> RemoteResult<Established> {
    let addr = resolve_addr(config)?;
    let tcp = TcpStream::connect_timeout(&addr, config.timeout()).map_err(|e| {
        RemoteError::from(e).with_context(format!("TCP connection to {}", config.address()))
    })?;

    let mut session =
        Session::new().map_err(|e| RemoteError::protocol(format!("Failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_ms(config));
    session
        .handshake()
        .map_err(|e| map_ssh_error(e).with_context(format!("SSH handshake with {}", config.address())))?;

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| RemoteError::protocol("Server presented no host key"))?;
    let entry = host_entry_name(&config.host, config.port);
    trust.verify(&entry, key_type_name(key_type), key)?;

    let auth_method = authenticate(&session, config)?;
    log::info!("SFTP authenticated to {} via {}", config.address(), auth_method);

    let sftp = session.sftp().map_err(|e| map_ssh_error(e).with_context("SFTP channel"))?;
    let home = sftp
        .realpath(Path::new("."))
        .map(|p| path_text(&p))
        .unwrap_or_else(|_| "/".to_string());

    let banner = session.banner().map(|b| b.to_string());
    Ok(Established {
        session,
        home,
        banner,
        auth_method,
    })
}

fn resolve_addr(config: &ConnectionConfig) -> RemoteResult<SocketAddr> {
    if config.host.trim().is_empty() {
        return Err(RemoteError::invalid_config("Host is empty"));
    }
    (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| RemoteError::network(format!("Cannot resolve {}: {}", config.address(), e)))?
        .next()
        .ok_or_else(|| RemoteError::network(format!("{} resolved to no addresses", config.address())))
}

fn timeout_ms(config: &ConnectionConfig) -> u32 {
    u32::try_from(config.timeout().as_millis()).unwrap_or(u32::MAX)
}

fn authenticate(session: &Session, config: &ConnectionConfig) -> RemoteResult<&'static str> {
    let user = config.username.as_str();

    if let Some(key_path) = config.key_path.as_deref().filter(|p| !p.is_empty()) {
        let passphrase = config.key_passphrase.as_deref().filter(|p| !p.is_empty());
        session
            .userauth_pubkey_file(user, None, Path::new(key_path), passphrase)
            .map_err(|e| RemoteError::auth(format!("Key authentication failed for {}: {}", user, e)))?;
        if session.authenticated() {
            return Ok("publickey");
        }
        return Err(RemoteError::auth(format!("Key {} was not accepted for {}", key_path, user)));
    }

    if session.userauth_password(user, &config.password).is_ok() && session.authenticated() {
        return Ok("password");
    }

    struct PasswordPrompt<'a> {
        password: &'a str,
    }

    impl ssh2::KeyboardInteractivePrompt for PasswordPrompt<'_> {
        fn prompt(&mut self, _username: &str, _instructions: &str, prompts: &[ssh2::Prompt]) -> Vec<String> {
            prompts.iter().map(|_| self.password.to_string()).collect()
        }
    }

    let mut prompt = PasswordPrompt {
        password: &config.password,
    };
    if session.userauth_keyboard_interactive(user, &mut prompt).is_ok() && session.authenticated() {
        return Ok("keyboard-interactive");
    }

    Err(RemoteError::auth(format!("Authentication failed for {}", user)))
}

fn key_type_name(t: HostKeyType) -> &'static str {
    match t {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

pub(crate) fn map_ssh_error(e: ssh2::Error) -> RemoteError {
    let msg = e.message().to_string();
    match e.code() {
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) | ErrorCode::SFTP(SSH_FX_NO_SUCH_PATH) => RemoteError::not_found(msg),
        ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => RemoteError::permission_denied(msg),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_TIMEOUT) => {
            RemoteError::timeout(msg)
        }
        ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV) => RemoteError::network(msg),
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => RemoteError::auth(msg),
        ErrorCode::SFTP(code) => RemoteError::protocol(msg).with_context(format!("SFTP status {}", code)),
        ErrorCode::Session(code) => RemoteError::protocol(msg).with_context(format!("libssh2 error {}", code)),
    }
}

fn ssh_err(what: String) -> impl FnOnce(ssh2::Error) -> RemoteError {
    move |e| map_ssh_error(e).with_context(what)
}

fn path_text(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

pub(crate) fn stat_is_dir(stat: &FileStat) -> bool {
    match stat.perm {
        Some(mode) => mode & 0o170000 == 0o040000,
        None => stat.is_dir(),
    }
}

fn stat_is_link(stat: &FileStat) -> bool {
    stat.perm.map(|m| m & 0o170000 == 0o120000).unwrap_or(false)
}

fn format_mtime(mtime: Option<u64>) -> (String, Option<i64>) {
    let Some(secs) = mtime.and_then(|t| i64::try_from(t).ok()) else {
        return (String::new(), None);
    };
    match Local.timestamp_opt(secs, 0).single() {
        Some(t) => (t.format("%Y-%m-%d %H:%M").to_string(), Some(secs)),
        None => (String::new(), Some(secs)),
    }
}

fn entry_from_stat(sftp: &ssh2::Sftp, dir: &str, path: &Path, stat: &FileStat) -> Option<RemoteEntry> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    if name == "." || name == ".." {
        return None;
    }
    let full = join_remote(dir, &name);
    // readdir reports the link itself; follow it to learn the target kind
    let is_dir = if stat_is_link(stat) {
        sftp.stat(Path::new(&full)).map(|s| stat_is_dir(&s)).unwrap_or(false)
    } else {
        stat_is_dir(stat)
    };
    let (modified, modified_unix) = format_mtime(stat.mtime);
    Some(RemoteEntry {
        name,
        path: full,
        is_dir,
        size: if is_dir { 0 } else { stat.size.unwrap_or(0) },
        modified,
        modified_unix,
    })
}

// ─── RemoteSession ───────────────────────────────────────────────────

#[async_trait]
impl RemoteSession for SecureSession {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn connect(&mut self) -> RemoteResult<String> {
        self.disconnect().await;
        log::info!("SFTP connecting to {}", self.config.address());

        let config = self.config.clone();
        let trust = self.trust.clone();
        let est = tokio::task::spawn_blocking(move || establish(&config, &trust))
            .await
            .map_err(|e| RemoteError::protocol(format!("connect task failed: {}", e)))??;

        self.cwd = est.home;
        self.session = Some(est.session);

        if let Some(dir) = self.config.initial_directory.clone().filter(|d| !d.trim().is_empty()) {
            if let Err(e) = self.change_directory(&dir).await {
                log::warn!("Initial directory {} unavailable: {}", dir, e);
            }
        }

        let mut message = format!(
            "Connected to {} (SFTP, {})",
            self.config.address(),
            est.auth_method
        );
        if let Some(banner) = est.banner {
            message.push('\n');
            message.push_str(&banner);
        }
        Ok(message)
    }

    async fn current_directory(&mut self) -> String {
        if self.session.is_some() {
            self.cwd.clone()
        } else {
            ".".to_string()
        }
    }

    async fn is_connected(&mut self) -> bool {
        if self.session.is_none() {
            return false;
        }
        let limit = self.config.timeout();
        let check = self.run("liveness check", |session| {
            let sftp = session.sftp().map_err(map_ssh_error)?;
            sftp.realpath(Path::new(".")).map_err(map_ssh_error)?;
            Ok(())
        });
        let outcome = tokio::time::timeout(limit, check).await;
        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::debug!("SFTP liveness check failed: {}", e);
                self.session = None;
                false
            }
            Err(_) => {
                log::debug!("SFTP liveness check timed out after {:?}", limit);
                self.session = None;
                false
            }
        }
    }

    async fn change_directory(&mut self, path: &str) -> RemoteResult<String> {
        let target = self.resolve(path);
        let resolved = self
            .run("change directory", move |session| {
                let sftp = session.sftp().map_err(map_ssh_error)?;
                let real = sftp
                    .realpath(Path::new(&target))
                    .map_err(ssh_err(format!("realpath {}", target)))?;
                let stat = sftp.stat(&real).map_err(ssh_err(format!("stat {}", target)))?;
                if !stat_is_dir(&stat) {
                    return Err(RemoteError::not_found(format!("{} is not a directory", target)));
                }
                Ok(path_text(&real))
            })
            .await?;
        self.cwd = resolved.clone();
        Ok(resolved)
    }

    async fn list_files(&mut self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let dir = self.resolve(path);
        let mut entries = self
            .run("list", move |session| {
                let sftp = session.sftp().map_err(map_ssh_error)?;
                let raw = sftp
                    .readdir(Path::new(&dir))
                    .map_err(ssh_err(format!("list {}", dir)))?;
                Ok(raw
                    .iter()
                    .filter_map(|(p, stat)| entry_from_stat(&sftp, &dir, p, stat))
                    .collect::<Vec<_>>())
            })
            .await?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn download_file(
        &mut self,
        remote: &str,
        local: &Path,
        ctl: &TransferControl,
    ) -> RemoteResult<u64> {
        let remote = self.resolve(remote);
        let local: PathBuf = local.to_path_buf();
        let ctl = ctl.clone();
        let chunk = self.chunk_size;
        self.run("download", move |session| {
            let sftp = session.sftp().map_err(map_ssh_error)?;
            let mut src = sftp
                .open(Path::new(&remote))
                .map_err(ssh_err(format!("open {}", remote)))?;
            if let Ok(stat) = src.stat() {
                ctl.set_total(stat.size.unwrap_or(0));
            }
            if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RemoteError::from(e).with_context(format!("create {}", parent.display())))?;
            }
            let mut dst = std::fs::File::create(&local)
                .map_err(|e| RemoteError::from(e).with_context(format!("create {}", local.display())))?;

            let mut buf = vec![0u8; chunk];
            let mut done = 0u64;
            loop {
                ctl.check_cancelled()?;
                let n = src
                    .read(&mut buf)
                    .map_err(|e| RemoteError::from(e).with_context(format!("read {}", remote)))?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buf[..n])
                    .map_err(|e| RemoteError::local_io(format!("write {}: {}", local.display(), e)))?;
                done += n as u64;
                ctl.advance_blocking(n as u64)?;
            }
            dst.flush()
                .map_err(|e| RemoteError::local_io(format!("flush {}: {}", local.display(), e)))?;
            Ok(done)
        })
        .await
    }

    async fn upload_file(
        &mut self,
        local: &Path,
        remote: &str,
        ctl: &TransferControl,
    ) -> RemoteResult<u64> {
        let remote = self.resolve(remote);
        let local: PathBuf = local.to_path_buf();
        let ctl = ctl.clone();
        let chunk = self.chunk_size;
        self.run("upload", move |session| {
            let mut src = std::fs::File::open(&local)
                .map_err(|e| RemoteError::local_io(format!("open {}: {}", local.display(), e)))?;
            if let Ok(meta) = src.metadata() {
                ctl.set_total(meta.len());
            }

            let sftp = session.sftp().map_err(map_ssh_error)?;
            let parent = remote_parent(&remote);
            match sftp.stat(Path::new(&parent)) {
                Ok(stat) if stat_is_dir(&stat) => {}
                Ok(_) => return Err(RemoteError::not_found(format!("{} is not a directory", parent))),
                Err(e) => return Err(map_ssh_error(e).with_context(format!("remote folder {}", parent))),
            }
            let mut dst = sftp
                .create(Path::new(&remote))
                .map_err(ssh_err(format!("create {}", remote)))?;

            let mut buf = vec![0u8; chunk];
            let mut done = 0u64;
            loop {
                ctl.check_cancelled()?;
                let n = src
                    .read(&mut buf)
                    .map_err(|e| RemoteError::local_io(format!("read {}: {}", local.display(), e)))?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buf[..n])
                    .map_err(|e| RemoteError::from(e).with_context(format!("write {}", remote)))?;
                done += n as u64;
                ctl.advance_blocking(n as u64)?;
            }
            dst.flush()
                .map_err(|e| RemoteError::from(e).with_context(format!("flush {}", remote)))?;
            Ok(done)
        })
        .await
    }

    async fn delete_file(&mut self, path: &str) -> RemoteResult<()> {
        let target = self.resolve(path);
        self.run("delete file", move |session| {
            let sftp = session.sftp().map_err(map_ssh_error)?;
            sftp.unlink(Path::new(&target))
                .map_err(ssh_err(format!("delete {}", target)))
        })
        .await
    }

    async fn delete_folder(&mut self, path: &str) -> RemoteResult<()> {
        let target = self.resolve(path);
        self.run("delete folder", move |session| {
            let sftp = session.sftp().map_err(map_ssh_error)?;
            sftp.rmdir(Path::new(&target))
                .map_err(ssh_err(format!("remove folder {}", target)))
        })
        .await
    }

    async fn create_folder(&mut self, path: &str) -> RemoteResult<()> {
        let target = self.resolve(path);
        self.run("create folder", move |session| {
            let sftp = session.sftp().map_err(map_ssh_error)?;
            sftp.mkdir(Path::new(&target), 0o755)
                .map_err(ssh_err(format!("create folder {}", target)))
        })
        .await
    }

    async fn rename_file(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        self.run("rename", move |session| {
            let sftp = session.sftp().map_err(map_ssh_error)?;
            sftp.rename(Path::new(&src), Path::new(&dst), None)
                .map_err(ssh_err(format!("rename {} -> {}", src, dst)))
        })
        .await
    }

    async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.cwd = ".".to_string();
        let _ = tokio::task::spawn_blocking(move || {
            let _ = session.disconnect(None, "Client disconnecting", None);
        })
        .await;
        log::info!("SFTP disconnected from {}", self.config.address());
    }
}
