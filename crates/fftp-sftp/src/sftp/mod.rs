pub mod session;
pub mod trust;

pub use session::SecureSession;
pub use trust::{HostIdentity, HostTrustStore, MismatchAction, MismatchPolicy, TrustDecision};
