//! End-to-end sync session tests.
//!
//! Each test drives a [`aurum_sync::Downloader`] against scripted peers over
//! an in-process transport. Tests run under paused time, so idle ticks and
//! scripted delays cost no wall clock.

use crate::generators::{build_on, chain};
use crate::harness::{PeerScript, TestNet};
use aurum_network::PeerId;
use aurum_sync::{DownloaderEvent, SyncConfig, SyncError, SyncStatus};
use std::sync::Arc;
use std::time::Duration;

fn small_batches() -> SyncConfig {
    SyncConfig {
        max_header_fetch: 16,
        max_block_fetch: 8,
        peer_idle: Duration::from_millis(10),
        ..SyncConfig::default()
    }
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_happy_path_writes_in_order() {
    let local = chain(100);
    let remote = Arc::new(build_on(&local, 20, 7));

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer("master", remote.clone(), PeerScript::default());
    net.add_peer("helper", remote.clone(), PeerScript::default());
    let mut events = net.downloader.subscribe();

    net.downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap();

    assert_eq!(net.chain.writes(), (101..=120).collect::<Vec<u64>>());
    assert_eq!(net.chain.height(), 120);
    assert_eq!(net.chain.head_hash(), remote[120].hash());
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Started);
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Done);
    assert_eq!(net.downloader.status(), SyncStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_multi_batch_download() {
    let local = chain(10);
    let remote = Arc::new(build_on(&local, 90, 11));

    let net = TestNet::with_config(&local, small_batches());
    let (master, peer) = net.add_peer("master", remote.clone(), PeerScript::default());
    net.add_peer("p2", remote.clone(), PeerScript::default());
    net.add_peer("p3", remote.clone(), PeerScript::default());

    net.downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap();

    assert_eq!(net.chain.writes(), (11..=100).collect::<Vec<u64>>());
    assert_eq!(net.chain.head_hash(), remote[100].hash());
}

// ============================================================================
// Fork Reconciliation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fork_resync_overwrites_tail() {
    let shared = chain(95);
    let local = build_on(&shared, 5, 1); // local tip at 100
    let remote = Arc::new(build_on(&shared, 25, 2)); // remote tip at 120

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer("master", remote.clone(), PeerScript::default());

    net.downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap();

    // The ancestor sits at 95; everything above is refetched in order.
    assert!(peer.reverse_header_requests() >= 1);
    assert_eq!(net.chain.writes(), (96..=120).collect::<Vec<u64>>());
    assert_eq!(net.chain.head_hash(), remote[120].hash());
}

#[tokio::test(start_paused = true)]
async fn test_equal_height_completes_without_writes() {
    let local = chain(50);
    let remote = Arc::new(local.clone());

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer("master", remote, PeerScript::default());
    let mut events = net.downloader.subscribe();

    net.downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap();

    assert!(net.chain.writes().is_empty());
    assert_eq!(net.chain.height(), 50);
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Started);
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Done);
}

#[tokio::test(start_paused = true)]
async fn test_empty_local_chain_skips_ancestor_probe() {
    let local = chain(0);
    let remote = Arc::new(build_on(&local, 20, 3));

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer("master", remote, PeerScript::default());

    net.downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 0)
        .await
        .unwrap();

    // top == 0 resolves the ancestor locally.
    assert_eq!(peer.reverse_header_requests(), 0);
    assert_eq!(net.chain.writes(), (1..=20).collect::<Vec<u64>>());
}

// ============================================================================
// Ancestor Discovery Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fork_too_deep() {
    let shared = chain(10);
    let local = build_on(&shared, 40, 1);
    let remote = Arc::new(build_on(&shared, 40, 2));

    let config = SyncConfig {
        max_fork_ancestry: 8,
        ..small_batches()
    };
    let net = TestNet::with_config(&local, config);
    let (master, peer) = net.add_peer("master", remote, PeerScript::default());
    let mut events = net.downloader.subscribe();

    let err = net
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ForkTooDeep));
    assert!(net.chain.writes().is_empty());
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Started);
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_empty_ancestor_batch_is_invalid() {
    let local = chain(20);
    let remote = Arc::new(build_on(&local, 10, 3));

    let net = TestNet::new(&local);
    let script = PeerScript {
        empty_reverse_headers: true,
        ..PeerScript::default()
    };
    let (master, peer) = net.add_peer("master", remote, script);

    let err = net
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InvalidAncestor));
}

#[tokio::test(start_paused = true)]
async fn test_height_probe_hash_mismatch() {
    let local = chain(20);
    let remote = Arc::new(build_on(&local, 10, 3));

    let net = TestNet::new(&local);
    let script = PeerScript {
        stale_head_probe: true,
        ..PeerScript::default()
    };
    let (master, peer) = net.add_peer("master", remote, script);

    let err = net
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::HashMismatch));
    assert_eq!(net.downloader.status(), SyncStatus::Idle);
}

// ============================================================================
// Peer Failure and Churn
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bad_header_peer_does_not_poison_session() {
    let local = chain(10);
    let remote = Arc::new(build_on(&local, 50, 4));

    let net = TestNet::with_config(&local, small_batches());
    let (master, peer) = net.add_peer("master", remote.clone(), PeerScript::default());
    net.add_peer(
        "bad",
        remote.clone(),
        PeerScript {
            corrupt_headers: true,
            ..PeerScript::default()
        },
    );

    net.downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap();

    // The bad peer's reservations reverted; every height written exactly once.
    assert_eq!(net.chain.writes(), (11..=60).collect::<Vec<u64>>());
    assert_eq!(net.chain.head_hash(), remote[60].hash());
}

#[tokio::test(start_paused = true)]
async fn test_peer_churn_reassigns_reservations() {
    let local = chain(100);
    let remote = Arc::new(build_on(&local, 60, 5));

    let net = TestNet::with_config(&local, small_batches());
    let (master, peer) = net.add_peer("master", remote.clone(), PeerScript::default());
    let (stalled, _) = net.add_peer(
        "stalled",
        remote.clone(),
        PeerScript {
            mute_blocks: true,
            ..PeerScript::default()
        },
    );

    // The stalled peer fetches headers but sits on its block reservations
    // until it is deregistered. It then rejoins healthy, mid-session.
    let net_ref = &net;
    let rejoin_remote = remote.clone();
    let sync = net_ref
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100);
    let churn = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        net_ref.downloader.unregister_peer(&stalled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        net_ref.add_peer("stalled", rejoin_remote, PeerScript::default())
    };

    let (result, _) = tokio::join!(sync, churn);
    result.unwrap();

    // Reverted reservations were reassigned; no height written twice.
    assert_eq!(net.chain.writes(), (101..=160).collect::<Vec<u64>>());
    assert_eq!(net.chain.head_hash(), remote[160].hash());
}

#[tokio::test(start_paused = true)]
async fn test_mid_session_registration_is_admitted() {
    let local = chain(100);
    let remote = Arc::new(build_on(&local, 60, 6));

    let net = TestNet::with_config(&local, small_batches());
    let slow = PeerScript {
        response_delay: Duration::from_millis(15),
        ..PeerScript::default()
    };
    let (master, peer) = net.add_peer("master", remote.clone(), slow);

    let late_remote = remote.clone();
    let net_ref = &net;
    let sync = net_ref
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100);

    let late = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        net_ref.add_peer("late", late_remote, PeerScript::default())
    };

    let (result, (_, late_peer)) = tokio::join!(sync, late);
    result.unwrap();

    // The late peer was admitted and pulled work for the running session.
    assert!(late_peer.header_requests() > 0);
    assert_eq!(net.chain.writes(), (101..=160).collect::<Vec<u64>>());
}

// ============================================================================
// Master Failure and Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_master_disconnect_aborts_session() {
    let local = chain(50);
    let remote = Arc::new(build_on(&local, 40, 6));

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer(
        "master",
        remote,
        PeerScript {
            mute_blocks: true,
            ..PeerScript::default()
        },
    );
    let mut events = net.downloader.subscribe();

    let downloader = net.downloader.clone();
    let gone = master.clone();
    let drop_master = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        downloader.unregister_peer(&gone);
    });

    let err = net
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap_err();
    drop_master.await.unwrap();

    assert!(matches!(err, SyncError::SyncAborted));
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Started);
    assert_eq!(events.recv().await.unwrap(), DownloaderEvent::Failed);
    assert_eq!(net.downloader.status(), SyncStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_under_load_keeps_prefix_ordered() {
    let local = chain(100);
    let remote = Arc::new(build_on(&local, 200, 8));

    let net = TestNet::with_config(&local, small_batches());
    let slow = PeerScript {
        response_delay: Duration::from_millis(20),
        ..PeerScript::default()
    };
    let (master, peer) = net.add_peer("master", remote.clone(), slow.clone());
    net.add_peer("p2", remote.clone(), slow);

    let downloader = net.downloader.clone();
    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        downloader.cancel();
    });

    let err = net
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap_err();
    cancel.await.unwrap();

    assert!(matches!(err, SyncError::SyncAborted));
    // Whatever was written is a gap-free ascending prefix.
    let writes = net.chain.writes();
    let expected: Vec<u64> = (101..101 + writes.len() as u64).collect();
    assert_eq!(writes, expected);
    assert_eq!(net.downloader.status(), SyncStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_second_synchronise_is_busy() {
    let local = chain(10);
    let remote = Arc::new(build_on(&local, 5, 9));

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer(
        "master",
        remote,
        PeerScript {
            mute_blocks: true,
            ..PeerScript::default()
        },
    );

    let downloader = net.downloader.clone();
    let master_id = master.clone();
    let tip = peer.tip_hash();
    let session =
        tokio::spawn(async move { downloader.synchronise(&master_id, tip, 1_000, 100).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(net.downloader.status(), SyncStatus::Fetching);

    let err = net
        .downloader
        .synchronise(&master, peer.tip_hash(), 1_000, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Busy));

    net.downloader.cancel();
    net.downloader.cancel(); // idempotent

    let first = session.await.unwrap();
    assert!(matches!(first, Err(SyncError::SyncAborted)));
    assert_eq!(net.downloader.status(), SyncStatus::Idle);

    // The master worker was blocked waiting for blocks when the cancel fired.
    assert_eq!(
        net.downloader.peer_last_error(&master),
        Some("Operation cancelled".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_terminate_tears_down_running_session() {
    let local = chain(10);
    let remote = Arc::new(build_on(&local, 5, 10));

    let net = TestNet::new(&local);
    let (master, peer) = net.add_peer(
        "master",
        remote,
        PeerScript {
            mute_blocks: true,
            ..PeerScript::default()
        },
    );

    let downloader = net.downloader.clone();
    let master_id = master.clone();
    let tip = peer.tip_hash();
    let session =
        tokio::spawn(async move { downloader.synchronise(&master_id, tip, 1_000, 100).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    net.downloader.terminate().await;

    assert!(matches!(session.await.unwrap(), Err(SyncError::SyncAborted)));
    assert!(matches!(
        net.downloader
            .synchronise(&master, peer.tip_hash(), 1_000, 100)
            .await,
        Err(SyncError::Busy)
    ));
}

// ============================================================================
// Unknown Peer
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unknown_master_fails_fast() {
    let local = chain(10);
    let net = TestNet::new(&local);

    let err = net
        .downloader
        .synchronise(&PeerId::new("ghost"), net.chain.head_hash(), 10, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::PeerNotFound(_)));
    assert_eq!(net.downloader.status(), SyncStatus::Idle);
}
