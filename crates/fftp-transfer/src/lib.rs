//! # fftp-transfer
//!
//! Everything between "the user picked some files" and bytes moving:
//!
//! | Module       | Purpose                                                   |
//! |--------------|-----------------------------------------------------------|
//! | `conflict`   | Pure overwrite/skip/rename decision for upload collisions |
//! | `engine`     | Runs one transfer item against a leased session           |
//! | `pool`       | Per-session connections, one transfer per connection      |
//! | `queue`      | FIFO queue with bounded concurrency and event stream      |
//! | `directory`  | Recursive directory upload                                |

pub mod conflict;
pub mod directory;
pub mod engine;
pub mod pool;
pub mod queue;

pub use conflict::{ConflictDecision, ConflictPolicy, ConflictPrompt, ConflictResolver, LocalStat, PromptAnswer};
pub use engine::{EngineObserver, TransferEngine};
pub use pool::{Reservation, SessionFactory, SessionLease, SessionPool};
pub use queue::{ProgressSnapshot, QueueConfig, QueueStatus, TransferEvent, TransferQueue};
