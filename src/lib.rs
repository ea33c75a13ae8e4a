//! # fftp
//!
//! Remote file transfer over SFTP, FTP and FTPS.
//!
//! | Crate           | Purpose                                                     |
//! |-----------------|-------------------------------------------------------------|
//! | `fftp-core`     | Data model, errors, the `RemoteSession` trait, throttling   |
//! | `fftp-sftp`     | SSH file sessions and the trust-on-first-use host key store |
//! | `fftp-ftp`      | FTP / FTPS sessions                                         |
//! | `fftp-transfer` | Conflict resolution, transfer engine, queue, session pool   |
//!
//! This crate picks a backend per connection and wires the pieces
//! together behind [`TransferService`].

pub mod backend;
pub mod logging;
pub mod service;
pub mod settings;

pub use fftp_core;
pub use fftp_ftp;
pub use fftp_sftp;
pub use fftp_transfer;

pub use backend::{open_session, BackendFactory};
pub use logging::init_logging;
pub use service::{TransferService, TransferServiceState};
pub use settings::{AppSettings, TransferSettings};
