//! Link failure scenarios.
//!
//! A transport failure on one peer must only send that peer into
//! reconnection; links to every other peer keep carrying updates.

use sync_client::SyncEvent;
use sync_types::SyncState;
use tokio::sync::broadcast::error::TryRecvError;

use super::{has_task, init_tracing, write_task};
use crate::topology::{wait_until, FamilyTopology};

#[tokio::test]
async fn failed_link_leaves_other_peers_syncing() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob", "Carol"])
        .await
        .unwrap();
    let (alice, bob, carol) = (topology.device(0), topology.device(1), topology.device(2));
    let mut alice_events = alice.coordinator().subscribe();

    let carol_port = carol.coordinator().local_port().unwrap();
    assert!(topology.network().sever(carol_port) >= 2);

    write_task(alice, "after-cut", "written while Carol reconnects");
    wait_until("task at Bob", || has_task(bob, "after-cut"))
        .await
        .unwrap();
    assert!(alice
        .coordinator()
        .get_connected_peers()
        .iter()
        .any(|p| p.device_id == bob.device_id()));

    wait_until("task at Carol after reconnect", || has_task(carol, "after-cut"))
        .await
        .unwrap();
    topology.wait_fully_linked().await.unwrap();

    loop {
        match alice_events.try_recv() {
            Ok(SyncEvent::PeerDisconnected { device_id, .. }) => {
                assert_eq!(device_id, carol.device_id(), "only Carol's link failed");
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    topology.shutdown().await;
}

#[tokio::test]
async fn departed_peer_degrades_status_until_evicted() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob", "Carol"])
        .await
        .unwrap();
    let (alice, bob, carol) = (topology.device(0), topology.device(1), topology.device(2));

    carol.shutdown().await;

    wait_until("Alice degraded", || {
        alice.coordinator().get_status().status == SyncState::Degraded
    })
    .await
    .unwrap();
    wait_until("Carol evicted", || {
        let status = alice.coordinator().get_status();
        status.status == SyncState::Connected && status.peer_count == 1
    })
    .await
    .unwrap();

    let peers = alice.coordinator().get_connected_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].device_id, bob.device_id());

    topology.shutdown().await;
}

#[tokio::test]
async fn status_events_are_throttled() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob"]).await.unwrap();
    let alice = topology.device(0);
    let mut events = alice.coordinator().subscribe();

    // Every stop/start pair changes the status twice.
    for _ in 0..10 {
        alice.coordinator().stop().await.unwrap();
        alice.coordinator().start().await.unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::StatusChanged(status) = event {
            statuses.push(status);
        }
    }
    assert!(!statuses.is_empty());
    assert!(statuses.len() < 20, "{} status events for 20 changes", statuses.len());
    for pair in statuses.windows(2) {
        assert_ne!(pair[0], pair[1], "identical consecutive status events");
    }

    topology.shutdown().await;
}
