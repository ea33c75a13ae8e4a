//! Stateful FTP client: owns the control connection and issues commands.
//!
//! Lifecycle: connect → optional `AUTH TLS` → login (with fallbacks) →
//! `PBSZ`/`PROT P` for FTPS → `TYPE I` → `PWD` → optional initial `CWD`.

use crate::ftp::connection;
use crate::ftp::parser::{self, ListedEntry};
use crate::ftp::protocol::{parse_pwd, FtpCodec, FtpResponse};
use crate::ftp::tls::{self, TlsContext};
use crate::ftp::transfer::{self, DataStream};
use fftp_core::{
    ConnectionConfig, Protocol, RemoteError, RemoteErrorKind, RemoteResult, TlsMode, TransferControl,
};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Chunk size for streaming transfers (64 KiB).
pub const DEFAULT_CHUNK: usize = 65_536;

/// How long to wait for the server to settle after `ABOR`.
const ABORT_DRAIN: Duration = Duration::from_secs(2);

pub struct FtpClient {
    codec: FtpCodec,
    config: ConnectionConfig,
    tls: Option<TlsContext>,
    cwd: String,
    banner: String,
    chunk_size: usize,
}

impl FtpClient {
    /// Connect, authenticate and prepare for binary transfers.
    pub async fn connect(config: ConnectionConfig) -> RemoteResult<Self> {
        if config.host.trim().is_empty() {
            return Err(RemoteError::invalid_config("Host must not be empty"));
        }
        let addr = config.address();

        let tls = if config.protocol == Protocol::Ftps {
            Some(TlsContext::new(&config.host, config.accept_invalid_certs)?)
        } else {
            None
        };

        let (mut codec, banner) = connection::connect(&config, tls.as_ref()).await?;

        // ── Explicit FTPS: AUTH TLS ──────────────────────────────
        if let (Some(ctx), TlsMode::Explicit) = (tls.as_ref(), config.tls_mode) {
            let resp = codec.execute("AUTH TLS").await?;
            if resp.code != 234 {
                return Err(RemoteError::network(format!("AUTH TLS rejected: {}", resp.text()))
                    .with_code(resp.code)
                    .with_context(&addr));
            }
            codec = tls::upgrade_to_tls(codec, ctx).await?;
        }

        // ── Authenticate ─────────────────────────────────────────
        let welcome = login(&mut codec, &config).await.map_err(|e| e.with_context(&addr))?;

        // ── Protect the data channel ─────────────────────────────
        if tls.is_some() {
            codec.expect_ok("PBSZ 0").await?;
            codec.expect_ok("PROT P").await?;
        }

        codec.expect_ok("TYPE I").await?;

        let mut client = Self {
            codec,
            config,
            tls,
            cwd: "/".to_string(),
            banner: banner.text(),
            chunk_size: DEFAULT_CHUNK,
        };
        client.cwd = client.pwd().await.unwrap_or_else(|_| "/".into());

        if let Some(dir) = client.config.initial_directory.clone().filter(|d| !d.is_empty()) {
            if let Err(e) = client.cwd(&dir).await {
                log::warn!("{}: initial directory {} unavailable: {}", addr, dir, e);
            }
        }

        log::info!("FTP connected to {} as {}", addr, client.config.username);
        Ok(client.with_welcome(welcome))
    }

    fn with_welcome(mut self, welcome: String) -> Self {
        if !welcome.is_empty() {
            self.banner = format!("{}\n{}", self.banner, welcome);
        }
        self
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub fn current_dir(&self) -> &str {
        &self.cwd
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1024);
    }

    fn data_timeout(&self) -> Duration {
        self.config.timeout()
    }

    // ─── Navigation ──────────────────────────────────────────────

    pub async fn noop(&mut self) -> RemoteResult<()> {
        self.codec.expect_ok("NOOP").await.map(|_| ())
    }

    pub async fn pwd(&mut self) -> RemoteResult<String> {
        let resp = self.codec.expect_ok("PWD").await?;
        parse_pwd(&resp.text())
    }

    /// Change into `path`; returns the new absolute directory.
    pub async fn cwd(&mut self, path: &str) -> RemoteResult<String> {
        self.codec
            .expect_ok(&format!("CWD {}", path))
            .await
            .map_err(|e| not_found_if_rejected(e, path))?;
        let now = self.pwd().await.unwrap_or_else(|_| path.to_string());
        self.cwd = now.clone();
        Ok(now)
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// List `dir` (absolute or relative to the working directory).
    /// The working directory is left unchanged. Returns the absolute
    /// directory that was listed with its entries.
    pub async fn list(&mut self, dir: &str) -> RemoteResult<(String, Vec<ListedEntry>)> {
        let previous = self.cwd.clone();
        let target = self.cwd(dir).await?;

        let listed = self.retrieve_text("LIST").await;

        let in_sync = !matches!(&listed, Err(e) if e.is_connection_lost());
        if target != previous && in_sync {
            if let Err(e) = self.cwd(&previous).await {
                log::debug!("could not return to {}: {}", previous, e);
            }
        }
        let body = listed?;
        Ok((target, parser::parse_listing(&body)))
    }

    async fn retrieve_text(&mut self, cmd: &str) -> RemoteResult<String> {
        let timeout = self.data_timeout();
        let Some(mut ds) = self.open_transfer(cmd).await? else {
            return Ok(String::new());
        };
        let body = ds.read_to_string(timeout).await;
        drop(ds);
        let body = match body {
            Ok(b) => b,
            Err(e) => {
                self.abort_transfer().await;
                return Err(e);
            }
        };
        self.finish_transfer().await?;
        Ok(body)
    }

    // ─── Data transfers ──────────────────────────────────────────

    /// Negotiate the data channel, issue `cmd`, connect. `None` means the
    /// server completed the command without opening a channel.
    async fn open_transfer(&mut self, cmd: &str) -> RemoteResult<Option<DataStream>> {
        let timeout = self.data_timeout();
        let pending = transfer::prepare(&mut self.codec, self.config.passive, timeout).await?;
        let resp = self.codec.execute(cmd).await?;
        if resp.is_completion() {
            return Ok(None);
        }
        if !resp.is_preliminary() {
            return Err(resp.to_error());
        }
        pending.establish(self.tls.as_ref(), timeout).await.map(Some)
    }

    /// Read the `226` that closes a data transfer.
    async fn finish_transfer(&mut self) -> RemoteResult<FtpResponse> {
        let done = self.codec.read_response().await?;
        if !done.is_completion() {
            return Err(done.to_error());
        }
        Ok(done)
    }

    /// Best-effort `ABOR` after a cancelled transfer, draining the
    /// `426`/`226` pair so the control channel stays in sync.
    async fn abort_transfer(&mut self) {
        if self.codec.send_command("ABOR").await.is_err() {
            return;
        }
        for _ in 0..2 {
            match tokio::time::timeout(ABORT_DRAIN, self.codec.read_response()).await {
                Ok(Ok(r)) if r.code == 226 || r.code == 225 => break,
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
    }

    /// Size via `SIZE`, if the server supports it.
    pub async fn size(&mut self, path: &str) -> Option<u64> {
        let resp = self.codec.execute(&format!("SIZE {}", path)).await.ok()?;
        if resp.code != 213 {
            return None;
        }
        resp.text().split_whitespace().nth(1)?.trim().parse::<u64>().ok()
    }

    /// `RETR` into `local`, creating missing local parent directories.
    pub async fn download(&mut self, remote: &str, local: &Path, ctl: &TransferControl) -> RemoteResult<u64> {
        ctl.check_cancelled()?;
        if let Some(total) = self.size(remote).await {
            ctl.set_total(total);
        }

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                RemoteError::local_io(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }

        let Some(mut ds) = self
            .open_transfer(&format!("RETR {}", remote))
            .await
            .map_err(|e| not_found_if_rejected(e, remote))?
        else {
            fs::File::create(local).await?;
            return Ok(0);
        };

        let mut file = fs::File::create(local)
            .await
            .map_err(|e| RemoteError::local_io(format!("Cannot write {}: {}", local.display(), e)))?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;

        let streamed = async {
            loop {
                let n = ds.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await.map_err(|e| {
                    RemoteError::local_io(format!("Write to {} failed: {}", local.display(), e))
                })?;
                written += n as u64;
                ctl.advance(n as u64).await?;
            }
            file.flush().await?;
            Ok::<(), RemoteError>(())
        }
        .await;
        drop(ds);

        if let Err(e) = streamed {
            self.abort_transfer().await;
            return Err(e);
        }
        self.finish_transfer().await?;
        Ok(written)
    }

    /// `STOR` from `local`. The remote parent must exist; the server
    /// rejects the command otherwise.
    pub async fn upload(&mut self, local: &Path, remote: &str, ctl: &TransferControl) -> RemoteResult<u64> {
        ctl.check_cancelled()?;
        let mut file = fs::File::open(local)
            .await
            .map_err(|e| RemoteError::local_io(format!("Cannot read {}: {}", local.display(), e)))?;
        let total = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        ctl.set_total(total);

        let Some(mut ds) = self.open_transfer(&format!("STOR {}", remote)).await? else {
            return Ok(0);
        };

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;
        let streamed = async {
            loop {
                let n = file.read(&mut buf).await.map_err(|e| {
                    RemoteError::local_io(format!("Read from {} failed: {}", local.display(), e))
                })?;
                if n == 0 {
                    break;
                }
                ds.write_all(&buf[..n]).await?;
                sent += n as u64;
                ctl.advance(n as u64).await?;
            }
            Ok::<(), RemoteError>(())
        }
        .await;

        if let Err(e) = streamed {
            drop(ds);
            self.abort_transfer().await;
            return Err(e);
        }
        ds.finish().await?;
        self.finish_transfer().await?;
        Ok(sent)
    }

    // ─── File management ─────────────────────────────────────────

    pub async fn delete(&mut self, path: &str) -> RemoteResult<()> {
        self.codec
            .expect_ok(&format!("DELE {}", path))
            .await
            .map(|_| ())
            .map_err(|e| not_found_if_rejected(e, path))
    }

    pub async fn rmdir(&mut self, path: &str) -> RemoteResult<()> {
        self.codec
            .expect_ok(&format!("RMD {}", path))
            .await
            .map(|_| ())
            .map_err(|e| not_found_if_rejected(e, path))
    }

    pub async fn mkdir(&mut self, path: &str) -> RemoteResult<()> {
        self.codec.expect_ok(&format!("MKD {}", path)).await.map(|_| ())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        self.codec
            .expect(&format!("RNFR {}", from), 3)
            .await
            .map_err(|e| not_found_if_rejected(e, from))?;
        self.codec.expect_ok(&format!("RNTO {}", to)).await.map(|_| ())
    }

    /// `QUIT`, ignoring the outcome.
    pub async fn quit(&mut self) {
        let _ = tokio::time::timeout(ABORT_DRAIN, self.codec.execute("QUIT")).await;
        self.codec.shutdown().await;
    }
}

// ─── Login ───────────────────────────────────────────────────────────

/// Log in with the configured credentials, then the fallbacks: anonymous
/// with an empty password (for anonymous-style configs), and, when the
/// compatibility flag is set, lower/upper-cased usernames.
async fn login(codec: &mut FtpCodec, config: &ConnectionConfig) -> RemoteResult<String> {
    let first = match login_as(codec, &config.username, &config.password).await {
        Ok(welcome) => return Ok(welcome),
        Err(e) if e.kind == RemoteErrorKind::Auth => e,
        Err(e) => return Err(e),
    };

    for (user, pass) in login_fallbacks(config) {
        log::info!("FTP login as '{}' rejected, retrying as '{}'", config.username, user);
        match login_as(codec, &user, &pass).await {
            Ok(welcome) => return Ok(welcome),
            Err(e) if e.kind == RemoteErrorKind::Auth => continue,
            Err(e) => return Err(e),
        }
    }
    Err(first)
}

pub(crate) fn login_fallbacks(config: &ConnectionConfig) -> Vec<(String, String)> {
    let user = config.username.as_str();
    let mut out: Vec<(String, String)> = Vec::new();
    let anonymous_style = user.is_empty() || user.eq_ignore_ascii_case("anonymous") || config.password.is_empty();
    if anonymous_style && !(user == "anonymous" && config.password.is_empty()) {
        out.push(("anonymous".into(), String::new()));
    }
    if config.legacy_login_case_retry {
        for variant in [user.to_lowercase(), user.to_uppercase()] {
            if variant != user && !out.iter().any(|(u, _)| *u == variant) {
                out.push((variant, config.password.clone()));
            }
        }
    }
    out
}

async fn login_as(codec: &mut FtpCodec, user: &str, pass: &str) -> RemoteResult<String> {
    let user = if user.is_empty() { "anonymous" } else { user };
    let resp = codec.execute(&format!("USER {}", user)).await?;
    let resp = match resp.code {
        230 => resp,
        331 => codec.execute(&format!("PASS {}", pass)).await?,
        332 => return Err(RemoteError::auth("Server requires an account (ACCT), which is not supported")),
        _ => return Err(auth_error(&resp)),
    };
    if resp.code == 230 || resp.code == 202 {
        Ok(resp.text())
    } else {
        Err(auth_error(&resp))
    }
}

fn auth_error(resp: &FtpResponse) -> RemoteError {
    let e = resp.to_error();
    match resp.code {
        // Transient service errors are not credential problems.
        421 => e,
        c if c >= 400 => RemoteError::auth(format!("Login failed: {}", resp.text())).with_code(c),
        _ => e,
    }
}

/// A bare `550` on a path-taking command most often means "no such file".
fn not_found_if_rejected(e: RemoteError, path: &str) -> RemoteError {
    if e.code == Some(550) && e.kind == RemoteErrorKind::Protocol {
        RemoteError::not_found(format!("{}: {}", path, e.message)).with_code(550)
    } else {
        e
    }
}
