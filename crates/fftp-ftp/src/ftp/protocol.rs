//! Control-channel codec (RFC 959 §4).
//!
//! Sends CRLF-terminated commands and reads single- and multi-line
//! replies. Every read is bounded by the session timeout so a silent
//! server cannot wedge the caller.

use fftp_core::{RemoteError, RemoteResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// One server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn to_error(&self) -> RemoteError {
        RemoteError::from_reply(self.code, &self.text())
    }
}

pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

pub struct FtpCodec {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
    read_timeout: Duration,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream, read_timeout: Duration) -> Self {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let (rd, wr) = stream.into_split();
        Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
            read_timeout,
            peer,
            local,
        }
    }

    pub fn from_tls(stream: TlsStream<TcpStream>, read_timeout: Duration) -> Self {
        let peer = stream.get_ref().0.peer_addr().ok();
        let local = stream.get_ref().0.local_addr().ok();
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
            read_timeout,
            peer,
            local,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Server end of the control connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Our end of the control connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Send a raw command; CRLF is appended here.
    pub async fn send_command(&mut self, cmd: &str) -> RemoteResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            WriteHalf::Plain(w) => w.write_all(line.as_bytes()).await?,
            WriteHalf::Tls(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
        }
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line_raw(&mut self) -> RemoteResult<String> {
        let mut buf = String::new();
        let limit = self.read_timeout;
        let reader = &mut self.reader;
        let read = async {
            match reader {
                ReadHalf::Plain(r) => r.read_line(&mut buf).await,
                ReadHalf::Tls(r) => r.read_line(&mut buf).await,
            }
        };
        let n = timeout(limit, read)
            .await
            .map_err(|_| RemoteError::timeout("Server did not reply in time"))??;
        if n == 0 {
            return Err(RemoteError::network("Server closed connection"));
        }
        Ok(buf)
    }

    /// Read one complete reply.
    ///
    /// ```text
    /// 220-Welcome
    /// 220-second line
    /// 220 End of greeting
    /// ```
    pub async fn read_response(&mut self) -> RemoteResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let first = first.trim_end_matches(['\r', '\n']).to_string();
        let code = parse_code(&first)?;
        let mut lines = vec![first.clone()];

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next = next.trim_end_matches(['\r', '\n']).to_string();
                let done = next.starts_with(&terminator) || next == code.to_string();
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!("<<< {}", resp.lines.last().map(String::as_str).unwrap_or(""));
        Ok(resp)
    }

    pub async fn execute(&mut self, cmd: &str) -> RemoteResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send `cmd` and require a reply in the `class`xx range.
    pub async fn expect(&mut self, cmd: &str, class: u16) -> RemoteResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        if resp.code / 100 != class {
            return Err(resp.to_error());
        }
        Ok(resp)
    }

    pub async fn expect_ok(&mut self, cmd: &str) -> RemoteResult<FtpResponse> {
        self.expect(cmd, 2).await
    }

    /// Best-effort close of the write side.
    pub async fn shutdown(&mut self) {
        let _ = match &mut self.writer {
            WriteHalf::Plain(w) => w.shutdown().await,
            WriteHalf::Tls(w) => w.shutdown().await,
        };
    }
}

fn parse_code(line: &str) -> RemoteResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| RemoteError::protocol(format!("Invalid reply line: '{}'", line)))
}

/// Extract the directory from `257 "/some/path" is current directory`.
/// Embedded quotes are doubled per RFC 959.
pub fn parse_pwd(text: &str) -> RemoteResult<String> {
    let start = text
        .find('"')
        .ok_or_else(|| RemoteError::protocol(format!("Cannot parse PWD reply: {}", text)))?;
    let rest = &text[start + 1..];
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
                continue;
            }
            return Ok(out);
        }
        out.push(c);
    }
    Err(RemoteError::protocol(format!("Cannot parse PWD reply: {}", text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (FtpCodec, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (FtpCodec::from_tcp(client, Duration::from_secs(2)), server)
    }

    #[tokio::test]
    async fn reads_multi_line_reply() {
        let (mut codec, mut server) = pair().await;
        server
            .write_all(b"220-Welcome\r\n220-more\r\n220 ready\r\n")
            .await
            .unwrap();
        let resp = codec.read_response().await.unwrap();
        assert_eq!(resp.code, 220);
        assert_eq!(resp.lines.len(), 3);
        assert!(resp.is_completion());
    }

    #[tokio::test]
    async fn expect_ok_maps_rejection() {
        let (mut codec, mut server) = pair().await;
        let srv = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"CWD /nope\r\n");
            server
                .write_all(b"550 /nope: No such file or directory\r\n")
                .await
                .unwrap();
            server
        });
        let err = codec.expect_ok("CWD /nope").await.unwrap_err();
        assert_eq!(err.kind, fftp_core::RemoteErrorKind::NotFound);
        assert_eq!(err.code, Some(550));
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let mut codec = FtpCodec::from_tcp(client, Duration::from_millis(50));
        let err = codec.read_response().await.unwrap_err();
        assert_eq!(err.kind, fftp_core::RemoteErrorKind::Timeout);
    }

    #[test]
    fn pwd_with_doubled_quotes() {
        assert_eq!(parse_pwd("257 \"/home/user\" is cwd").unwrap(), "/home/user");
        assert_eq!(parse_pwd("257 \"/a\"\"b\"").unwrap(), "/a\"b");
        assert!(parse_pwd("257 nothing").is_err());
    }
}
