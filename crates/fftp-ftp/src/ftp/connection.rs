//! Control connection: TCP connect under the session timeout, immediate
//! TLS for implicit FTPS, then the welcome banner.

use crate::ftp::protocol::{FtpCodec, FtpResponse};
use crate::ftp::tls::TlsContext;
use fftp_core::{ConnectionConfig, Protocol, RemoteError, RemoteResult, TlsMode};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connect and read the banner. Explicit FTPS still needs `AUTH TLS`
/// afterwards (see `client.rs`).
pub async fn connect(
    config: &ConnectionConfig,
    tls: Option<&TlsContext>,
) -> RemoteResult<(FtpCodec, FtpResponse)> {
    let addr = config.address();
    let dur = config.timeout();

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| RemoteError::timeout(format!("TCP connect to {} timed out", addr)).with_context(&addr))?
        .map_err(|e| RemoteError::network(format!("TCP connect to {}: {}", addr, e)).with_context(&addr))?;
    tcp.set_nodelay(true).ok();

    let mut codec = match (config.protocol, config.tls_mode, tls) {
        (Protocol::Ftps, TlsMode::Implicit, Some(ctx)) => {
            let stream = timeout(dur, ctx.connect(tcp, "Implicit"))
                .await
                .map_err(|_| RemoteError::timeout(format!("TLS handshake with {} timed out", addr)))??;
            FtpCodec::from_tls(stream, dur)
        }
        _ => FtpCodec::from_tcp(tcp, dur),
    };

    let banner = codec.read_response().await?;
    if !banner.is_completion() {
        return Err(banner.to_error().with_context(&addr));
    }
    log::debug!("{}: {}", addr, banner.text());
    Ok((codec, banner))
}
