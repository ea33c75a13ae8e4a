use fftp::settings::{AppSettings, TransferSettings};
use fftp::TransferService;
use fftp_core::RemoteErrorKind;
use fftp_sftp::{HostTrustStore, TrustDecision};
use fftp_transfer::ConflictPolicy;

const KEY_A: &[u8] = b"ssh-ed25519 first key blob";
const KEY_B: &[u8] = b"ssh-ed25519 second key blob";

#[test]
fn trust_on_first_use_then_match_then_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");

    let store = HostTrustStore::load(&path).unwrap();
    let first = tokio_test::assert_ok!(store.verify("sftp.example.org", "ssh-ed25519", KEY_A));
    assert_eq!(first, TrustDecision::FirstUse);
    assert!(path.exists());

    let reloaded = HostTrustStore::load(&path).unwrap();
    assert_eq!(
        reloaded.verify("sftp.example.org", "ssh-ed25519", KEY_A).unwrap(),
        TrustDecision::Match
    );

    let err = tokio_test::assert_err!(reloaded.verify("sftp.example.org", "ssh-ed25519", KEY_B));
    assert_eq!(err.kind, RemoteErrorKind::HostKeyMismatch);
    assert_eq!(
        HostTrustStore::load(&path)
            .unwrap()
            .verify("sftp.example.org", "ssh-ed25519", KEY_A)
            .unwrap(),
        TrustDecision::Match
    );
}

#[test]
fn settings_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf").join("settings.json");
    let settings = AppSettings {
        transfers: TransferSettings {
            max_concurrent_transfers: 3,
            speed_limit_bytes_per_sec: 1_000_000,
            conflict_policy: ConflictPolicy::Rename,
            ..Default::default()
        },
        trust_store_path: Some(dir.path().join("hosts")),
        log_filter: Some("debug".into()),
    };
    settings.save(&path).unwrap();
    assert_eq!(AppSettings::load(&path).unwrap(), settings);

    let json = std::fs::read_to_string(&path).unwrap();
    assert!(json.contains("\"maxConcurrentTransfers\": 3"));
    assert!(json.contains("\"conflictPolicy\": \"rename\""));
}

#[tokio::test]
async fn service_loads_its_trust_store_from_settings() {
    let dir = tempfile::tempdir().unwrap();
    let hosts = dir.path().join("hosts");
    HostTrustStore::load(&hosts)
        .unwrap()
        .verify("[box.lan]:2222", "ssh-rsa", KEY_A)
        .unwrap();

    let settings = AppSettings {
        trust_store_path: Some(hosts),
        ..Default::default()
    };
    let svc = TransferService::new(settings).unwrap();
    assert_eq!(svc.trust().len(), 1);
    assert!(svc.trust().get("[box.lan]:2222").is_some());
}
