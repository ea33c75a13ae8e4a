mod common;

use common::*;
use fftp_core::memory::MemoryServer;
use fftp_core::TransferStatus;
use fftp_transfer::{ConflictPolicy, TransferEvent};
use std::time::Duration;

#[tokio::test]
async fn never_runs_more_than_the_limit() {
    let server = MemoryServer::new();
    server.mkdir_all("/up");
    server.set_chunk_delay(Duration::from_millis(5));
    let svc = service(settings(2, 4, ConflictPolicy::Overwrite));
    let id = attach(&svc, &server).await;

    let dir = tempfile::tempdir().unwrap();
    let mut events = svc.queue().subscribe();
    for i in 0..10 {
        let local = write_local(dir.path(), &format!("f{}.bin", i), &[i as u8; 16]);
        svc.queue()
            .enqueue_upload(&id, local, format!("/up/f{}.bin", i))
            .unwrap();
        assert!(svc.queue().status().active <= 2);
    }
    svc.queue().wait_idle().await;

    assert!(server.peak_concurrency() <= 2);
    assert_eq!(svc.queue().status().completed, 10);
    assert!(svc.queue().failed().is_empty());

    let mut running = 0i32;
    let mut peak = 0i32;
    while let Ok(ev) = events.try_recv() {
        if let TransferEvent::Status { status, .. } = ev {
            match status {
                TransferStatus::Starting => running += 1,
                TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled => running -= 1,
                _ => {}
            }
            peak = peak.max(running);
        }
    }
    assert_eq!(running, 0);
    assert!(peak <= 2, "saw {} at once", peak);
}

#[tokio::test]
async fn single_slot_runs_in_enqueue_order() {
    let server = MemoryServer::new();
    server.mkdir_all("/up");
    let svc = service(settings(1, 1, ConflictPolicy::Overwrite));
    let id = attach(&svc, &server).await;

    let dir = tempfile::tempdir().unwrap();
    let a = svc
        .queue()
        .enqueue_upload(&id, write_local(dir.path(), "a.txt", b"aaaa"), "/up/a.txt")
        .unwrap();
    let b = svc
        .queue()
        .enqueue_upload(&id, write_local(dir.path(), "b.txt", b"bbbbbbbb"), "/up/b.txt")
        .unwrap();
    svc.queue().wait_idle().await;

    assert_eq!(server.start_order(), ["a.txt", "b.txt"]);
    let done: Vec<String> = svc.queue().completed().into_iter().map(|i| i.id).collect();
    assert_eq!(done, [a, b]);
    assert_eq!(server.read_file("/up/b.txt").unwrap(), b"bbbbbbbb");
}

#[tokio::test]
async fn cancelled_queued_item_never_starts() {
    let server = MemoryServer::new();
    server.mkdir_all("/up");
    server.set_chunk_delay(Duration::from_millis(20));
    let svc = service(settings(1, 1, ConflictPolicy::Overwrite));
    let id = attach(&svc, &server).await;
    let mut events = svc.queue().subscribe();

    let dir = tempfile::tempdir().unwrap();
    let a = svc
        .queue()
        .enqueue_upload(&id, write_local(dir.path(), "a.txt", b"12345678"), "/up/a.txt")
        .unwrap();
    let b = svc
        .queue()
        .enqueue_upload(&id, write_local(dir.path(), "b.txt", b"12345678"), "/up/b.txt")
        .unwrap();
    assert!(svc.queue().cancel(&b));
    svc.queue().wait_idle().await;

    assert_eq!(svc.queue().item(&a).unwrap().status, TransferStatus::Completed);
    let cancelled = svc.queue().item(&b).unwrap();
    assert_eq!(cancelled.status, TransferStatus::Cancelled);
    assert_eq!(cancelled.error.as_deref(), Some("Cancelled"));
    assert_eq!(server.start_order(), ["a.txt"]);
    assert!(!server.exists("/up/b.txt"));

    while let Ok(ev) = events.try_recv() {
        if let TransferEvent::Status { id, status, .. } = ev {
            if id == b {
                assert!(matches!(status, TransferStatus::Queued | TransferStatus::Cancelled));
            }
        }
    }
}

#[tokio::test]
async fn disconnect_cancels_the_sessions_transfers() {
    let server = MemoryServer::new();
    server.mkdir_all("/up");
    server.set_chunk_delay(Duration::from_millis(20));
    let svc = service(settings(1, 1, ConflictPolicy::Overwrite));
    let id = attach(&svc, &server).await;

    let dir = tempfile::tempdir().unwrap();
    for name in ["a.bin", "b.bin"] {
        svc.queue()
            .enqueue_upload(&id, write_local(dir.path(), name, &[7u8; 64]), format!("/up/{}", name))
            .unwrap();
    }
    assert!(svc.disconnect(&id).await);
    svc.queue().wait_idle().await;

    let failed = svc.queue().failed();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|i| i.status == TransferStatus::Cancelled));
}

#[tokio::test]
async fn speed_limit_change_reaches_settings_and_queue() {
    let server = MemoryServer::new();
    let mut svc = service(Default::default());
    let _ = attach(&svc, &server).await;
    svc.set_speed_limit(4096);
    svc.set_max_concurrent(0);
    assert_eq!(svc.settings().transfers.speed_limit_bytes_per_sec, 4096);
    assert_eq!(svc.queue().config().speed_limit_bytes_per_sec, 4096);
    assert_eq!(svc.queue().config().max_concurrent, 1);
}

#[tokio::test]
async fn busy_session_does_not_hold_back_another() {
    let slow = MemoryServer::new();
    slow.mkdir_all("/up");
    slow.set_chunk_delay(Duration::from_millis(30));
    let fast = MemoryServer::new();
    fast.mkdir_all("/up");
    let svc = service(settings(2, 1, ConflictPolicy::Overwrite));
    let a = attach(&svc, &slow).await;
    let b = attach(&svc, &fast).await;
    let mut events = svc.queue().subscribe();

    let dir = tempfile::tempdir().unwrap();
    let a1 = svc
        .queue()
        .enqueue_upload(&a, write_local(dir.path(), "a1.bin", &[1u8; 64]), "/up/a1.bin")
        .unwrap();
    let a2 = svc
        .queue()
        .enqueue_upload(&a, write_local(dir.path(), "a2.bin", &[2u8; 64]), "/up/a2.bin")
        .unwrap();
    let b1 = svc
        .queue()
        .enqueue_upload(&b, write_local(dir.path(), "b1.bin", &[3u8; 64]), "/up/b1.bin")
        .unwrap();
    // a2 waits for the session's only connection; b1 takes the free slot
    assert_eq!(svc.queue().item(&a2).unwrap().status, TransferStatus::Queued);
    assert_eq!(svc.queue().item(&b1).unwrap().status, TransferStatus::Starting);
    svc.queue().wait_idle().await;

    assert_eq!(svc.queue().status().completed, 3);
    assert_eq!(slow.start_order(), ["a1.bin", "a2.bin"]);
    assert_eq!(fast.start_order(), ["b1.bin"]);

    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let TransferEvent::Status { id, status, .. } = ev {
            seen.push((id, status));
        }
    }
    let at = |id: &str, status: TransferStatus| {
        seen.iter()
            .position(|(i, s)| i == id && *s == status)
            .unwrap()
    };
    assert!(at(&b1, TransferStatus::Starting) < at(&a1, TransferStatus::Completed));
    assert!(at(&a2, TransferStatus::Starting) > at(&a1, TransferStatus::Completed));
}
