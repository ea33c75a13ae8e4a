//! # fftp-core
//!
//! Shared ground for the remote transfer subsystem: the data model, the
//! error taxonomy, the [`RemoteSession`] capability both backends
//! implement, and the per-transfer control block (cancellation, progress,
//! throttling).

pub mod activity;
pub mod control;
pub mod error;
pub mod listing;
pub mod session;
pub mod throttle;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use activity::{ActivityLog, Severity};
pub use control::{ProgressFn, TransferControl};
pub use error::{RemoteError, RemoteErrorKind, RemoteResult};
pub use session::RemoteSession;
pub use throttle::RateLimiter;
pub use types::*;
