//! Legacy file-transfer protocol (RFC 959) with FTPS (RFC 4217).
//!
//! - `protocol`: control-channel codec
//! - `connection`: TCP connect, implicit TLS, banner
//! - `tls`: rustls connector, `AUTH TLS` upgrade
//! - `transfer`: PASV/EPSV/PORT data channels
//! - `parser`: Unix and Windows LIST lines
//! - `client`: stateful client (login fallbacks, transfers)
//! - `session`: `RemoteSession` adapter

pub mod client;
pub mod connection;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod transfer;

pub use client::FtpClient;
pub use session::LegacySession;
