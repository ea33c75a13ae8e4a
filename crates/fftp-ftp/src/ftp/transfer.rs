//! Data-channel management.
//!
//! - **PASV**, falling back to **EPSV** when the server refuses it
//! - **PORT** (or **EPRT** on IPv6) when passive mode is off
//!
//! Opening is two-phase: [`prepare`] negotiates the channel before the
//! transfer command is sent, [`DataChannel::establish`] connects or
//! accepts (and wraps TLS, for PROT P) once the server has answered it.

use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls::TlsContext;
use fftp_core::{RemoteError, RemoteResult};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

/// Negotiated but not yet connected data channel.
pub enum DataChannel {
    Passive(TcpStream),
    Active(TcpListener),
}

pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Negotiate a data channel on `codec`.
pub async fn prepare(codec: &mut FtpCodec, passive: bool, data_timeout: Duration) -> RemoteResult<DataChannel> {
    if passive {
        let tcp = match open_pasv(codec, data_timeout).await {
            Ok(tcp) => tcp,
            Err(e) if e.code.is_some() => {
                log::debug!("PASV refused ({}), trying EPSV", e);
                open_epsv(codec, data_timeout).await?
            }
            Err(e) => return Err(e),
        };
        Ok(DataChannel::Passive(tcp))
    } else {
        Ok(DataChannel::Active(open_active(codec).await?))
    }
}

impl DataChannel {
    /// Finish opening after the transfer command got its 1xx reply.
    pub async fn establish(self, tls: Option<&TlsContext>, data_timeout: Duration) -> RemoteResult<DataStream> {
        let tcp = match self {
            DataChannel::Passive(tcp) => tcp,
            DataChannel::Active(listener) => {
                let (tcp, peer) = timeout(data_timeout, listener.accept())
                    .await
                    .map_err(|_| RemoteError::timeout("Server never connected to the active data port"))?
                    .map_err(|e| RemoteError::network(format!("Active data accept: {}", e)))?;
                log::trace!("data connection from {}", peer);
                tcp
            }
        };
        match tls {
            Some(ctx) => {
                let stream = timeout(data_timeout, ctx.connect(tcp, "Data channel"))
                    .await
                    .map_err(|_| RemoteError::timeout("Data channel TLS handshake timed out"))??;
                Ok(DataStream::Tls(Box::new(stream)))
            }
            None => Ok(DataStream::Plain(tcp)),
        }
    }
}

impl DataStream {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DataStream::Plain(s) => s.read(buf).await,
            DataStream::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            DataStream::Plain(s) => s.write_all(buf).await,
            DataStream::Tls(s) => s.write_all(buf).await,
        }
    }

    /// Flush and close; for TLS this sends close_notify.
    pub async fn finish(mut self) -> std::io::Result<()> {
        match &mut self {
            DataStream::Plain(s) => s.shutdown().await,
            DataStream::Tls(s) => {
                s.flush().await?;
                s.shutdown().await
            }
        }
    }

    /// Drain the stream into a string (listing bodies).
    pub async fn read_to_string(&mut self, data_timeout: Duration) -> RemoteResult<String> {
        let mut buf = Vec::new();
        let read = async {
            match self {
                DataStream::Plain(s) => s.read_to_end(&mut buf).await,
                DataStream::Tls(s) => read_tls_to_end(s, &mut buf).await,
            }
        };
        timeout(data_timeout, read)
            .await
            .map_err(|_| RemoteError::timeout("Listing transfer timed out"))??;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Servers often drop the socket without close_notify after a listing;
/// treat that as end of data.
async fn read_tls_to_end(s: &mut TlsStream<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    match s.read_to_end(buf).await {
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(buf.len()),
        other => other,
    }
}

// ─── PASV ────────────────────────────────────────────────────────────

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`. The advertised host
/// is ignored in favour of the control peer; NAT'd servers often
/// advertise private addresses.
async fn open_pasv(codec: &mut FtpCodec, data_timeout: Duration) -> RemoteResult<TcpStream> {
    let resp = codec.expect_ok("PASV").await?;
    let advertised = parse_pasv_response(&resp.text())?;
    let addr = match codec.peer_addr() {
        Some(peer) => SocketAddr::new(peer.ip(), advertised.port()),
        None => advertised,
    };
    connect_data(addr, data_timeout, "PASV").await
}

pub(crate) fn parse_pasv_response(text: &str) -> RemoteResult<SocketAddr> {
    let bad = || RemoteError::protocol(format!("Cannot parse PASV reply: {}", text));
    let body = text.get(3..).ok_or_else(bad)?;
    let nums: Vec<u8> = body
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .map(|tok| tok.split(',').collect::<Vec<_>>())
        .find(|parts| parts.len() == 6 && parts.iter().all(|p| !p.is_empty()))
        .ok_or_else(bad)?
        .iter()
        .map(|p| p.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| RemoteError::protocol("PASV number out of range"))?;
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + nums[5] as u16;
    Ok(SocketAddr::new(ip, port))
}

// ─── EPSV ────────────────────────────────────────────────────────────

/// `229 Entering Extended Passive Mode (|||port|)`
async fn open_epsv(codec: &mut FtpCodec, data_timeout: Duration) -> RemoteResult<TcpStream> {
    let resp = codec.expect_ok("EPSV").await?;
    let port = parse_epsv_response(&resp.text())?;
    let peer = codec
        .peer_addr()
        .ok_or_else(|| RemoteError::network("EPSV: control connection has no peer address"))?;
    connect_data(SocketAddr::new(peer.ip(), port), data_timeout, "EPSV").await
}

pub(crate) fn parse_epsv_response(text: &str) -> RemoteResult<u16> {
    let bad = || RemoteError::protocol(format!("Cannot parse EPSV reply: {}", text));
    let open = text.find('(').ok_or_else(bad)?;
    let close = text[open..].find(')').map(|i| open + i).ok_or_else(bad)?;
    let inner = &text[open + 1..close];
    let delim = inner.chars().next().ok_or_else(bad)?;
    inner
        .split(delim)
        .nth(3)
        .filter(|p| !p.is_empty())
        .ok_or_else(bad)?
        .parse::<u16>()
        .map_err(|_| RemoteError::protocol("EPSV port out of range"))
}

async fn connect_data(addr: SocketAddr, data_timeout: Duration, what: &str) -> RemoteResult<TcpStream> {
    timeout(data_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RemoteError::timeout(format!("{} data connect to {} timed out", what, addr)))?
        .map_err(|e| RemoteError::network(format!("{} data connect to {}: {}", what, addr, e)))
}

// ─── PORT / EPRT ─────────────────────────────────────────────────────

/// Listen on the interface the control connection uses and announce it.
async fn open_active(codec: &mut FtpCodec) -> RemoteResult<TcpListener> {
    let local_ip = codec
        .local_addr()
        .map(|a| a.ip())
        .ok_or_else(|| RemoteError::network("Active mode: control connection has no local address"))?;
    let listener = TcpListener::bind(SocketAddr::new(local_ip, 0))
        .await
        .map_err(|e| RemoteError::network(format!("Active mode bind: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| RemoteError::network(format!("Active mode local_addr: {}", e)))?;

    let cmd = port_command(local);
    codec.expect_ok(&cmd).await?;
    Ok(listener)
}

pub(crate) fn port_command(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!(
                "PORT {},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                addr.port() / 256,
                addr.port() % 256
            )
        }
        IpAddr::V6(v6) => format!("EPRT |2|{}|{}|", v6, addr.port()),
    }
}
