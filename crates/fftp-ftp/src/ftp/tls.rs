//! TLS for explicit and implicit FTPS (RFC 4217).
//!
//! One connector is built per session and reused for the control and
//! every data connection, so servers that insist on TLS session reuse
//! for the data channel accept us.

use crate::ftp::protocol::{FtpCodec, ReadHalf, WriteHalf};
use fftp_core::{RemoteError, RemoteResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Connector plus the name presented in SNI / checked against the cert.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsContext {
    pub fn new(host: &str, accept_invalid_certs: bool) -> RemoteResult<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| RemoteError::invalid_config(format!("Invalid TLS host name '{}': {}", host, e)))?;
        Ok(Self {
            connector: build_tls_connector(accept_invalid_certs)?,
            server_name,
        })
    }

    pub async fn connect(&self, tcp: TcpStream, what: &str) -> RemoteResult<TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| RemoteError::network(format!("{} TLS handshake: {}", what, e)))
    }
}

pub fn build_tls_connector(accept_invalid_certs: bool) -> RemoteResult<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| RemoteError::invalid_config(format!("TLS setup: {}", e)))?;

    let config = if accept_invalid_certs {
        log::warn!("TLS certificate verification disabled for this connection");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::debug!("Skipping native certificate source: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Upgrade a plain control connection after `AUTH TLS` was accepted.
pub async fn upgrade_to_tls(codec: FtpCodec, tls: &TlsContext) -> RemoteResult<FtpCodec> {
    let read_timeout = codec.read_timeout();
    let tcp = reunite_plain(codec)?;
    let stream = tls.connect(tcp, "Explicit").await?;
    Ok(FtpCodec::from_tls(stream, read_timeout))
}

fn reunite_plain(codec: FtpCodec) -> RemoteResult<TcpStream> {
    let already = || RemoteError::protocol("Cannot upgrade: connection is already TLS");
    let rd = match codec.reader {
        ReadHalf::Plain(br) => br.into_inner(),
        ReadHalf::Tls(_) => return Err(already()),
    };
    let wr = match codec.writer {
        WriteHalf::Plain(w) => w,
        WriteHalf::Tls(_) => return Err(already()),
    };
    rd.reunite(wr)
        .map_err(|e| RemoteError::protocol(format!("Reunite failed: {}", e)))
}

/// Accepts any certificate chain; signatures are still checked so the
/// handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_both_connector_flavours() {
        assert!(build_tls_connector(false).is_ok());
        assert!(build_tls_connector(true).is_ok());
    }

    #[test]
    fn accepts_ip_and_dns_names() {
        assert!(TlsContext::new("127.0.0.1", true).is_ok());
        assert!(TlsContext::new("ftp.example.com", true).is_ok());
        assert!(TlsContext::new("bad host name", true).is_err());
    }
}
