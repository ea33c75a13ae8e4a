//! Host identity store (trust on first use).
//!
//! One identity per host name, kept in memory and mirrored to a text file
//! with one `name algorithm base64-key` line per host, the same shape as
//! an OpenSSH `known_hosts` file. Lines starting with `#` are ignored, a
//! comma-separated name list is split, and the last line for a name wins.
//!
//! The file is rewritten in full after every change, through a temporary
//! file in the same directory.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use fftp_core::{RemoteError, RemoteResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    /// e.g. `ssh-ed25519`, `ecdsa-sha2-nistp256`
    pub algorithm: String,
    /// Base64 of the raw public key blob.
    pub key: String,
}

impl HostIdentity {
    pub fn new(hostname: impl Into<String>, algorithm: impl Into<String>, key_blob: &[u8]) -> Self {
        Self {
            hostname: hostname.into(),
            algorithm: algorithm.into(),
            key: STANDARD.encode(key_blob),
        }
    }

    /// `SHA256:<unpadded base64>`, as `ssh-keygen -l` prints it.
    pub fn fingerprint(&self) -> String {
        let digest = match STANDARD.decode(&self.key) {
            Ok(blob) => Sha256::digest(&blob),
            Err(_) => Sha256::digest(self.key.as_bytes()),
        };
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    fn same_key(&self, other: &HostIdentity) -> bool {
        self.algorithm == other.algorithm && self.key == other.key
    }

    fn to_line(&self) -> String {
        format!("{} {} {}", self.hostname, self.algorithm, self.key)
    }
}

/// Name under which a host is stored: the bare host on port 22,
/// `[host]:port` otherwise.
pub fn host_entry_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Outcome of a successful [`HostTrustStore::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Unknown host; its key was recorded.
    FirstUse,
    Match,
    /// Key changed and the policy chose to replace the stored one.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchAction {
    Reject,
    Replace,
}

/// Consulted when a host presents a key different from the stored one.
pub trait MismatchPolicy: Send + Sync {
    fn on_mismatch(&self, stored: &HostIdentity, presented: &HostIdentity) -> MismatchAction;
}

/// Refuse every changed key.
pub struct RejectChanged;

impl MismatchPolicy for RejectChanged {
    fn on_mismatch(&self, _stored: &HostIdentity, _presented: &HostIdentity) -> MismatchAction {
        MismatchAction::Reject
    }
}

impl<F> MismatchPolicy for F
where
    F: Fn(&HostIdentity, &HostIdentity) -> MismatchAction + Send + Sync,
{
    fn on_mismatch(&self, stored: &HostIdentity, presented: &HostIdentity) -> MismatchAction {
        self(stored, presented)
    }
}

pub struct HostTrustStore {
    path: Option<PathBuf>,
    hosts: Mutex<BTreeMap<String, HostIdentity>>,
    policy: Box<dyn MismatchPolicy>,
}

impl std::fmt::Debug for HostTrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTrustStore")
            .field("path", &self.path)
            .field("hosts", &self.len())
            .finish()
    }
}

impl HostTrustStore {
    /// Store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            hosts: Mutex::new(BTreeMap::new()),
            policy: Box::new(RejectChanged),
        }
    }

    /// Load `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> RemoteResult<Self> {
        let path = path.into();
        let hosts = match std::fs::read_to_string(&path) {
            Ok(text) => parse_entries(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(RemoteError::local_io(format!(
                    "Cannot read trusted hosts file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        log::debug!("Loaded {} trusted host(s) from {}", hosts.len(), path.display());
        Ok(Self {
            path: Some(path),
            hosts: Mutex::new(hosts),
            policy: Box::new(RejectChanged),
        })
    }

    pub fn with_policy(mut self, policy: impl MismatchPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, hostname: &str) -> Option<HostIdentity> {
        self.hosts.lock().ok()?.get(hostname).cloned()
    }

    pub fn entries(&self) -> Vec<HostIdentity> {
        self.hosts
            .lock()
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget `hostname`. Returns whether it was known.
    pub fn remove(&self, hostname: &str) -> RemoteResult<bool> {
        let mut hosts = self.lock()?;
        if !hosts.contains_key(hostname) {
            return Ok(false);
        }
        self.commit(&mut hosts, hostname, None)?;
        Ok(true)
    }

    /// Check the key presented by `hostname` against the stored identity.
    pub fn verify(&self, hostname: &str, algorithm: &str, key_blob: &[u8]) -> RemoteResult<TrustDecision> {
        let presented = HostIdentity::new(hostname, algorithm, key_blob);
        let mut hosts = self.lock()?;

        let Some(stored) = hosts.get(hostname) else {
            log::info!(
                "Trusting new host {} ({} {})",
                hostname,
                presented.algorithm,
                presented.fingerprint()
            );
            self.commit(&mut hosts, hostname, Some(presented))?;
            return Ok(TrustDecision::FirstUse);
        };

        if stored.same_key(&presented) {
            return Ok(TrustDecision::Match);
        }

        match self.policy.on_mismatch(stored, &presented) {
            MismatchAction::Reject => {
                log::error!(
                    "Host key for {} changed: stored {} {}, presented {} {}",
                    hostname,
                    stored.algorithm,
                    stored.fingerprint(),
                    presented.algorithm,
                    presented.fingerprint()
                );
                Err(RemoteError::host_key_mismatch(
                    hostname,
                    format!(
                        "Host key changed (expected {}, got {}). Remove the stored entry to trust the new key.",
                        stored.fingerprint(),
                        presented.fingerprint()
                    ),
                ))
            }
            MismatchAction::Replace => {
                log::warn!(
                    "Replacing stored host key for {} with {} {}",
                    hostname,
                    presented.algorithm,
                    presented.fingerprint()
                );
                self.commit(&mut hosts, hostname, Some(presented))?;
                Ok(TrustDecision::Replaced)
            }
        }
    }

    fn lock(&self) -> RemoteResult<std::sync::MutexGuard<'_, BTreeMap<String, HostIdentity>>> {
        self.hosts
            .lock()
            .map_err(|_| RemoteError::local_io("Trusted hosts store is poisoned"))
    }

    /// Set or clear one entry and write the file. A failed write undoes
    /// the change, so nothing is trusted in memory that is not on disk.
    fn commit(
        &self,
        hosts: &mut BTreeMap<String, HostIdentity>,
        hostname: &str,
        identity: Option<HostIdentity>,
    ) -> RemoteResult<()> {
        let previous = match identity {
            Some(identity) => hosts.insert(hostname.to_string(), identity),
            None => hosts.remove(hostname),
        };
        if let Err(e) = self.persist(hosts) {
            match previous {
                Some(previous) => hosts.insert(hostname.to_string(), previous),
                None => hosts.remove(hostname),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, hosts: &BTreeMap<String, HostIdentity>) -> RemoteResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| {
            RemoteError::local_io(format!("Cannot write trusted hosts file {}: {}", path.display(), e))
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut body = String::new();
        for identity in hosts.values() {
            body.push_str(&identity.to_line());
            body.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }
}

fn parse_entries(text: &str) -> BTreeMap<String, HostIdentity> {
    let mut hosts = BTreeMap::new();
    for (no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(names), Some(algorithm), Some(key)) = (fields.next(), fields.next(), fields.next()) else {
            log::debug!("trusted hosts line {}: not `name algorithm key`, skipped", no + 1);
            continue;
        };
        for name in names.split(',').filter(|n| !n.is_empty()) {
            hosts.insert(
                name.to_string(),
                HostIdentity {
                    hostname: name.to_string(),
                    algorithm: algorithm.to_string(),
                    key: key.to_string(),
                },
            );
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use fftp_core::RemoteErrorKind;

    #[test]
    fn first_use_then_match() {
        let store = HostTrustStore::in_memory();
        assert_eq!(store.verify("h", "ssh-ed25519", b"key-a").unwrap(), TrustDecision::FirstUse);
        assert_eq!(store.verify("h", "ssh-ed25519", b"key-a").unwrap(), TrustDecision::Match);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn changed_key_is_rejected_by_default() {
        let store = HostTrustStore::in_memory();
        store.verify("h", "ssh-ed25519", b"key-a").unwrap();
        let err = store.verify("h", "ssh-ed25519", b"key-b").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::HostKeyMismatch);
        assert!(err.message.contains("SHA256:"));
        // the stored identity is untouched
        assert_eq!(store.get("h").unwrap().key, STANDARD.encode(b"key-a"));
    }

    #[test]
    fn algorithm_change_counts_as_mismatch() {
        let store = HostTrustStore::in_memory();
        store.verify("h", "ssh-rsa", b"same").unwrap();
        assert!(store.verify("h", "ssh-ed25519", b"same").is_err());
    }

    #[test]
    fn policy_can_replace() {
        let store = HostTrustStore::in_memory().with_policy(|_: &HostIdentity, _: &HostIdentity| MismatchAction::Replace);
        store.verify("h", "ssh-ed25519", b"key-a").unwrap();
        assert_eq!(store.verify("h", "ssh-ed25519", b"key-b").unwrap(), TrustDecision::Replaced);
        assert_eq!(store.verify("h", "ssh-ed25519", b"key-b").unwrap(), TrustDecision::Match);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");

        let store = HostTrustStore::load(&path).unwrap();
        assert!(store.is_empty());
        store.verify("alpha", "ssh-ed25519", b"a").unwrap();
        store.verify("[beta]:2222", "ssh-rsa", b"b").unwrap();

        let reloaded = HostTrustStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.verify("alpha", "ssh-ed25519", b"a").unwrap(), TrustDecision::Match);
        assert!(reloaded.verify("[beta]:2222", "ssh-rsa", b"other").is_err());

        assert!(reloaded.remove("alpha").unwrap());
        assert!(!reloaded.remove("alpha").unwrap());
        assert_eq!(HostTrustStore::load(&path).unwrap().len(), 1);
    }

    #[test]
    fn failed_write_does_not_trust_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let store = HostTrustStore::load(&path).unwrap();
        // the temporary file cannot be created over a directory
        let blocker = path.with_extension("tmp");
        std::fs::create_dir(&blocker).unwrap();

        let err = store.verify("h", "ssh-ed25519", b"key-a").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::LocalIo);
        assert!(store.is_empty());
        assert!(store.verify("h", "ssh-ed25519", b"key-a").is_err());

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(store.verify("h", "ssh-ed25519", b"key-a").unwrap(), TrustDecision::FirstUse);
        assert_eq!(HostTrustStore::load(&path).unwrap().len(), 1);
    }

    #[test]
    fn parses_comments_and_name_lists() {
        let text = "# comment\n\
                    \n\
                    one,two ssh-ed25519 AAAA\n\
                    broken-line\n\
                    one ssh-rsa BBBB\n";
        let hosts = parse_entries(text);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["one"].algorithm, "ssh-rsa");
        assert_eq!(hosts["two"].key, "AAAA");
    }

    #[test]
    fn entry_names_and_fingerprints() {
        assert_eq!(host_entry_name("example.org", 22), "example.org");
        assert_eq!(host_entry_name("example.org", 2222), "[example.org]:2222");

        let id = HostIdentity::new("h", "ssh-ed25519", b"blob");
        let fp = id.fingerprint();
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp, HostIdentity::new("other", "ssh-ed25519", b"blob").fingerprint());
    }
}
