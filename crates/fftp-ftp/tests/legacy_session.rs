//! Drives `LegacySession` against a small scripted FTP server running on
//! localhost (passive mode, plain text).

use fftp_core::{ConnectionConfig, Protocol, RemoteErrorKind, RemoteSession, TransferControl};
use fftp_ftp::LegacySession;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct FakeFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

#[derive(Clone)]
struct FakeServer {
    fs: Arc<Mutex<FakeFs>>,
    users: Arc<Vec<(String, String)>>,
    list_delay: Arc<Mutex<Duration>>,
}

fn resolve(cwd: &str, p: &str) -> String {
    let joined = if p.starts_with('/') {
        p.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), p)
    };
    let mut parts: Vec<&str> = Vec::new();
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent(p: &str) -> String {
    match p.rfind('/') {
        Some(0) | None => "/".into(),
        Some(i) => p[..i].into(),
    }
}

impl FakeServer {
    fn new(users: &[(&str, &str)]) -> Self {
        let mut fs = FakeFs::default();
        fs.dirs.insert("/".into());
        Self {
            fs: Arc::new(Mutex::new(fs)),
            users: Arc::new(users.iter().map(|(u, p)| (u.to_string(), p.to_string())).collect()),
            list_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Hold the LIST data channel open this long before sending anything.
    fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    fn put(&self, path: &str, data: &[u8]) {
        self.fs.lock().unwrap().files.insert(path.into(), data.to_vec());
    }

    fn mkdir(&self, path: &str) {
        self.fs.lock().unwrap().dirs.insert(path.into());
    }

    fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().unwrap().files.get(path).cloned()
    }

    async fn start(self) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let srv = self.clone();
                tokio::spawn(async move {
                    let _ = srv.handle(stream).await;
                });
            }
        });
        port
    }

    fn listing(&self, dir: &str) -> String {
        let fs = self.fs.lock().unwrap();
        let mut out = String::from("drwxr-xr-x 2 u g 4096 Jan 1 12:00 .\r\ndrwxr-xr-x 2 u g 4096 Jan 1 12:00 ..\r\n");
        let child = |p: &str| p != dir && parent(p) == dir;
        for d in fs.dirs.iter().filter(|d| child(d)) {
            let name = d.rsplit('/').next().unwrap();
            out.push_str(&format!("drwxr-xr-x 2 u g 4096 Jan 1 12:00 {}\r\n", name));
        }
        for (f, data) in fs.files.iter().filter(|(f, _)| child(f)) {
            let name = f.rsplit('/').next().unwrap();
            out.push_str(&format!("-rw-r--r-- 1 u g {} Jan 1 12:00 {}\r\n", data.len(), name));
        }
        out
    }

    async fn handle(self, stream: TcpStream) -> std::io::Result<()> {
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let mut cwd = "/".to_string();
        let mut user = String::new();
        let mut pasv: Option<TcpListener> = None;
        let mut rnfr: Option<String> = None;
        wr.write_all(b"220 fake ready\r\n").await?;

        let mut line = String::new();
        loop {
            line.clear();
            if rd.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end().to_string();
            let (cmd, arg) = match line.split_once(' ') {
                Some((c, a)) => (c.to_uppercase(), a.to_string()),
                None => (line.to_uppercase(), String::new()),
            };
            let reply: String = match cmd.as_str() {
                "USER" => {
                    user = arg;
                    "331 Password required".into()
                }
                "PASS" => {
                    if self.users.iter().any(|(u, p)| *u == user && *p == arg) {
                        "230 Logged in".into()
                    } else {
                        "530 Login incorrect.".into()
                    }
                }
                "TYPE" => "200 Type set".into(),
                "NOOP" => "200 NOOP ok".into(),
                "PWD" => format!("257 \"{}\" is the current directory", cwd),
                "CWD" => {
                    let target = resolve(&cwd, &arg);
                    if self.fs.lock().unwrap().dirs.contains(&target) {
                        cwd = target;
                        "250 Directory changed".into()
                    } else {
                        "550 Failed to change directory.".into()
                    }
                }
                "EPSV" => "502 EPSV not implemented".into(),
                "PASV" => {
                    let l = TcpListener::bind("127.0.0.1:0").await?;
                    let p = l.local_addr()?.port();
                    pasv = Some(l);
                    format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256)
                }
                "SIZE" => match self.get(&resolve(&cwd, &arg)) {
                    Some(d) => format!("213 {}", d.len()),
                    None => "550 Could not get file size.".into(),
                },
                "LIST" => {
                    let Some(l) = pasv.take() else {
                        wr.write_all(b"425 Use PASV first\r\n").await?;
                        continue;
                    };
                    wr.write_all(b"150 Here comes the directory listing\r\n").await?;
                    let (mut data, _) = l.accept().await?;
                    let delay = *self.list_delay.lock().unwrap();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    data.write_all(self.listing(&cwd).as_bytes()).await?;
                    data.shutdown().await?;
                    "226 Directory send OK".into()
                }
                "RETR" => {
                    let Some(l) = pasv.take() else {
                        wr.write_all(b"425 Use PASV first\r\n").await?;
                        continue;
                    };
                    match self.get(&resolve(&cwd, &arg)) {
                        Some(d) => {
                            wr.write_all(b"150 Opening BINARY mode data connection\r\n").await?;
                            let (mut data, _) = l.accept().await?;
                            data.write_all(&d).await?;
                            data.shutdown().await?;
                            "226 Transfer complete".into()
                        }
                        None => "550 Failed to open file.".into(),
                    }
                }
                "STOR" => {
                    let Some(l) = pasv.take() else {
                        wr.write_all(b"425 Use PASV first\r\n").await?;
                        continue;
                    };
                    let target = resolve(&cwd, &arg);
                    if !self.fs.lock().unwrap().dirs.contains(&parent(&target)) {
                        "553 Could not create file.".into()
                    } else {
                        wr.write_all(b"150 Ok to send data\r\n").await?;
                        let (mut data, _) = l.accept().await?;
                        let mut buf = Vec::new();
                        data.read_to_end(&mut buf).await?;
                        self.put(&target, &buf);
                        "226 Transfer complete".into()
                    }
                }
                "DELE" => {
                    if self.fs.lock().unwrap().files.remove(&resolve(&cwd, &arg)).is_some() {
                        "250 Delete operation successful".into()
                    } else {
                        "550 Delete operation failed.".into()
                    }
                }
                "MKD" => {
                    let target = resolve(&cwd, &arg);
                    let mut fs = self.fs.lock().unwrap();
                    if fs.dirs.contains(&parent(&target)) && !fs.dirs.contains(&target) {
                        fs.dirs.insert(target.clone());
                        format!("257 \"{}\" created", target)
                    } else {
                        "550 Create directory operation failed.".into()
                    }
                }
                "RMD" => {
                    if self.fs.lock().unwrap().dirs.remove(&resolve(&cwd, &arg)) {
                        "250 Remove directory operation successful".into()
                    } else {
                        "550 Remove directory operation failed.".into()
                    }
                }
                "RNFR" => {
                    let source = resolve(&cwd, &arg);
                    if self.fs.lock().unwrap().files.contains_key(&source) {
                        rnfr = Some(source);
                        "350 Ready for RNTO".into()
                    } else {
                        "550 RNFR command failed.".into()
                    }
                }
                "RNTO" => match rnfr.take() {
                    Some(source) => {
                        let mut fs = self.fs.lock().unwrap();
                        let data = fs.files.remove(&source).unwrap_or_default();
                        fs.files.insert(resolve(&cwd, &arg), data);
                        "250 Rename successful".into()
                    }
                    None => "503 RNFR required first".into(),
                },
                "QUIT" => {
                    wr.write_all(b"221 Goodbye\r\n").await?;
                    return Ok(());
                }
                _ => "502 Command not implemented".into(),
            };
            wr.write_all(format!("{}\r\n", reply).as_bytes()).await?;
        }
    }
}

fn config(port: u16, user: &str, pass: &str) -> ConnectionConfig {
    let mut c = ConnectionConfig::new(Protocol::Ftp, "127.0.0.1", user);
    c.port = port;
    c.password = pass.into();
    c.timeout_secs = 5;
    c
}

#[tokio::test]
async fn lists_sorted_and_dot_matches_empty() {
    let server = FakeServer::new(&[("bob", "pw")]);
    server.mkdir("/Docs");
    server.mkdir("/archive");
    server.put("/b.txt", b"bb");
    server.put("/A.txt", b"a");
    let port = server.clone().start().await;

    let mut s = LegacySession::new(config(port, "bob", "pw"));
    let msg = s.connect().await.unwrap();
    assert!(msg.contains("220 fake ready"));

    let dot = s.list_files(".").await.unwrap();
    let empty = s.list_files("").await.unwrap();
    assert_eq!(dot, empty);
    let names: Vec<_> = dot.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["archive", "Docs", "A.txt", "b.txt"]);
    assert_eq!(dot[3].path, "/b.txt");
    assert_eq!(dot[3].size, 2);
    assert_eq!(s.current_directory().await, "/");
}

#[tokio::test]
async fn upload_then_download_round_trips() {
    let server = FakeServer::new(&[("bob", "pw")]);
    server.mkdir("/up");
    let port = server.clone().start().await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("data.bin");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&src, &payload).unwrap();

    let mut s = LegacySession::new(config(port, "bob", "pw")).with_chunk_size(4096);
    s.connect().await.unwrap();
    let sent = s.upload_file(&src, "/up/data.bin", &TransferControl::default()).await.unwrap();
    assert_eq!(sent, payload.len() as u64);
    assert_eq!(server.get("/up/data.bin").unwrap(), payload);

    let listing = s.list_files("/up").await.unwrap();
    assert_eq!(listing[0].size, payload.len() as u64);
    // Listing another directory does not move the working directory.
    assert_eq!(s.current_directory().await, "/");

    let dst = dir.path().join("nested/deeper/copy.bin");
    let ctl = TransferControl::default();
    let got = s.download_file("/up/data.bin", &dst, &ctl).await.unwrap();
    assert_eq!(got, payload.len() as u64);
    assert_eq!(ctl.total(), payload.len() as u64);
    assert_eq!(std::fs::read(&dst).unwrap(), payload);
}

#[tokio::test]
async fn upload_into_missing_directory_fails() {
    let server = FakeServer::new(&[("bob", "pw")]);
    let port = server.clone().start().await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("x.txt");
    std::fs::write(&src, b"x").unwrap();

    let mut s = LegacySession::new(config(port, "bob", "pw"));
    s.connect().await.unwrap();
    let err = s
        .upload_file(&src, "/missing/x.txt", &TransferControl::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Some(553));
    assert!(server.get("/missing/x.txt").is_none());
    // The control channel is still usable.
    assert!(s.is_connected().await);
}

#[tokio::test]
async fn wrong_password_is_an_auth_error() {
    let server = FakeServer::new(&[("bob", "pw")]);
    let port = server.start().await;
    let mut s = LegacySession::new(config(port, "bob", "nope"));
    let err = s.connect().await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Auth);
    assert!(!s.is_connected().await);
}

#[tokio::test]
async fn empty_password_falls_back_to_anonymous() {
    let server = FakeServer::new(&[("anonymous", "")]);
    let port = server.start().await;
    let mut s = LegacySession::new(config(port, "guest", ""));
    s.connect().await.unwrap();
    assert!(s.is_connected().await);
}

#[tokio::test]
async fn username_case_retry_only_when_enabled() {
    let server = FakeServer::new(&[("alice", "pw")]);
    let port = server.start().await;

    let mut strict = LegacySession::new(config(port, "Alice", "pw"));
    assert_eq!(strict.connect().await.unwrap_err().kind, RemoteErrorKind::Auth);

    let mut cfg = config(port, "Alice", "pw");
    cfg.legacy_login_case_retry = true;
    let mut lenient = LegacySession::new(cfg);
    lenient.connect().await.unwrap();
}

#[tokio::test]
async fn missing_directory_is_not_found_and_caller_can_fall_back() {
    let server = FakeServer::new(&[("bob", "pw")]);
    server.put("/only.txt", b"1");
    let port = server.start().await;
    let mut s = LegacySession::new(config(port, "bob", "pw"));
    s.connect().await.unwrap();

    let err = s.list_files("/nope").await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::NotFound);
    let fallback = s.list_files_or_current("/nope").await.unwrap();
    assert_eq!(fallback.len(), 1);
}

#[tokio::test]
async fn file_management_commands() {
    let server = FakeServer::new(&[("bob", "pw")]);
    server.put("/old.txt", b"1");
    let port = server.clone().start().await;
    let mut s = LegacySession::new(config(port, "bob", "pw"));
    s.connect().await.unwrap();

    s.create_folder("/newdir").await.unwrap();
    s.rename_file("/old.txt", "/newdir/new.txt").await.unwrap();
    assert_eq!(server.get("/newdir/new.txt").unwrap(), b"1");
    assert_eq!(s.change_directory("/newdir").await.unwrap(), "/newdir");
    s.delete_file("new.txt").await.unwrap();
    s.change_directory("/").await.unwrap();
    s.delete_folder("/newdir").await.unwrap();
    assert!(s.list_files("/").await.unwrap().is_empty());
    assert_eq!(s.delete_file("/ghost").await.unwrap_err().kind, RemoteErrorKind::NotFound);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let server = FakeServer::new(&[("bob", "pw")]);
    let port = server.start().await;
    let mut s = LegacySession::new(config(port, "bob", "pw"));
    s.connect().await.unwrap();
    s.disconnect().await;
    assert!(!s.is_connected().await);
    s.disconnect().await;
    assert!(!s.is_connected().await);
    assert_eq!(s.current_directory().await, ".");
}

#[tokio::test]
async fn timed_out_listing_drops_the_control_channel() {
    let server = FakeServer::new(&[("bob", "pw")]);
    server.put("/a.txt", b"a");
    server.set_list_delay(Duration::from_millis(1500));
    let port = server.clone().start().await;

    let mut cfg = config(port, "bob", "pw");
    cfg.timeout_secs = 1;
    let mut s = LegacySession::new(cfg);
    s.connect().await.unwrap();

    let err = s.list_files("/").await.unwrap_err();
    assert_eq!(err.kind, RemoteErrorKind::Timeout);
    // The late 226 must not be read as the answer to a later command.
    assert!(!s.is_connected().await);
    assert_eq!(s.current_directory().await, ".");
    assert_eq!(s.list_files("/").await.unwrap_err().kind, RemoteErrorKind::NotConnected);

    server.set_list_delay(Duration::ZERO);
    s.connect().await.unwrap();
    assert_eq!(s.current_directory().await, "/");
    let names: Vec<_> = s.list_files("/").await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, ["a.txt"]);
}
