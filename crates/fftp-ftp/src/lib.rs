//! # fftp-ftp
//!
//! The legacy backend: plain FTP, explicit FTPS and implicit FTPS behind
//! [`fftp_core::RemoteSession`].

pub mod ftp;

pub use ftp::{FtpClient, LegacySession};
