//! Convergence scenarios.

use serde_json::json;
use sync_types::SyncState;

use super::{has_task, init_tracing, write_task};
use crate::assertions::{assert_converged, assert_no_lost_writes};
use crate::topology::{wait_until, FamilyTopology};

#[tokio::test]
async fn three_devices_converge() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob", "Carol"])
        .await
        .unwrap();

    write_task(topology.device(0), "a", "from Alice");
    write_task(topology.device(1), "b", "from Bob");
    write_task(topology.device(2), "c", "from Carol");
    topology.wait_converged().await.unwrap();

    let snapshots = topology.snapshot().unwrap();
    let written = [("tasks", "a"), ("tasks", "b"), ("tasks", "c")];
    let result = assert_no_lost_writes(&snapshots, &written);
    assert!(result.passed, "{:?}", result.failure_details);
    for device in topology.devices() {
        let status = device.coordinator().get_status();
        assert_eq!(status.status, SyncState::Connected);
        assert_eq!(status.peer_count, 2);
        assert!(status.last_sync_at.is_some());
    }

    topology.shutdown().await;
}

#[tokio::test]
async fn concurrent_writes_to_one_key_settle_on_one_value() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob"]).await.unwrap();
    let (alice, bob) = (topology.device(0), topology.device(1));

    write_task(alice, "dinner", "Pasta");
    write_task(bob, "dinner", "Curry");
    topology.wait_converged().await.unwrap();

    let snapshots = topology.snapshot().unwrap();
    let winner = snapshots[0].entry("tasks", "dinner").cloned().unwrap();
    assert!(winner == json!({"title": "Pasta"}) || winner == json!({"title": "Curry"}));
    assert!(assert_converged(&snapshots).passed);

    topology.shutdown().await;
}

#[tokio::test]
async fn offline_edits_merge_on_reconnect() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob"]).await.unwrap();
    let (alice, bob) = (topology.device(0), topology.device(1));

    bob.coordinator().stop().await.unwrap();
    assert_eq!(bob.coordinator().get_status().status, SyncState::Offline);

    write_task(alice, "while-away", "written by Alice");
    write_task(bob, "offline", "written by Bob");
    assert!(!has_task(alice, "offline"));
    assert!(!has_task(bob, "while-away"));

    bob.coordinator().start().await.unwrap();
    topology.wait_converged().await.unwrap();

    let snapshots = topology.snapshot().unwrap();
    let written = [("tasks", "while-away"), ("tasks", "offline")];
    let result = assert_no_lost_writes(&snapshots, &written);
    assert!(result.passed, "{:?}", result.failure_details);

    topology.shutdown().await;
}

#[tokio::test]
async fn force_sync_reaches_every_peer() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob", "Carol"])
        .await
        .unwrap();

    assert_eq!(topology.device(0).coordinator().force_sync().unwrap(), 2);
    write_task(topology.device(0), "after-force", "still flowing");
    wait_until("task everywhere", || {
        topology.devices().iter().all(|d| has_task(d, "after-force"))
    })
    .await
    .unwrap();

    topology.shutdown().await;
}

#[tokio::test]
async fn awareness_reaches_peers() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob"]).await.unwrap();
    let (alice, bob) = (topology.device(0), topology.device(1));

    alice
        .coordinator()
        .set_awareness(json!({"viewing": "calendar"}));
    wait_until("presence at Bob", || {
        bob.coordinator().get_peer_awareness().get(&alice.device_id())
            == Some(&json!({"viewing": "calendar"}))
    })
    .await
    .unwrap();

    topology.shutdown().await;
}
