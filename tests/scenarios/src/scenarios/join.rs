//! Family setup and join handshake scenarios.

use std::time::Duration;
use sync_client::{DiscoveryError, EngineError};
use sync_doc::FamilyError;
use sync_types::{FamilyId, Role};

use super::{has_task, init_tracing, write_task};
use crate::topology::{admit, wait_until, FamilyTopology, SETTLE_TIMEOUT};

/// Device A founds "Acme", device B asks to join, A approves and redeems the
/// token B presents when it links.
#[tokio::test]
async fn member_joins_through_admin_approval() {
    init_tracing();
    let mut topology = FamilyTopology::new();
    let alice = topology.add_device("Alice").await.unwrap();
    let acme = alice.create_family("Acme").await.unwrap();
    let bob = topology.add_device("Bob").await.unwrap();

    let state = admit(&alice, &bob, acme.id, Role::Member).await.unwrap();

    assert_eq!(state.family.id, acme.id);
    assert_eq!(state.family.name, "Acme");
    assert_eq!(state.current_device_id, bob.device_id());
    assert_eq!(state.role_of(&bob.device_id()), Some(Role::Member));
    assert_eq!(state.role_of(&alice.device_id()), Some(Role::Admin));
    assert!(!bob.family().is_admin().unwrap());
    assert!(alice.discovery().get_pending_join_requests().is_empty());

    // The registration travels back to the admin like any other write.
    wait_until("admin to see the new member", || {
        alice
            .family()
            .get_family_state()
            .ok()
            .flatten()
            .is_some_and(|s| s.role_of(&bob.device_id()) == Some(Role::Member))
    })
    .await
    .unwrap();

    topology.shutdown().await;
}

#[tokio::test]
async fn joined_device_syncs_family_data() {
    init_tracing();
    let (topology, _) = FamilyTopology::family("Acme", &["Alice", "Bob"]).await.unwrap();
    let (alice, bob) = (topology.device(0), topology.device(1));

    write_task(alice, "groceries", "Buy milk");
    wait_until("task at Bob", || has_task(bob, "groceries"))
        .await
        .unwrap();

    topology.shutdown().await;
}

#[tokio::test]
async fn rejected_request_never_joins() {
    init_tracing();
    let mut topology = FamilyTopology::new();
    let alice = topology.add_device("Alice").await.unwrap();
    let acme = alice.create_family("Acme").await.unwrap();
    let mallory = topology.add_device("Mallory").await.unwrap();

    wait_until("family advertisement", || {
        !mallory.discovery().get_discovered_families().is_empty()
    })
    .await
    .unwrap();
    let request = mallory.request_join(acme.id).await.unwrap();
    wait_until("join request at admin", || {
        alice.discovery().get_pending_join_requests().len() == 1
    })
    .await
    .unwrap();

    assert!(alice.reject_join_request(request.id).await.unwrap());
    assert!(!alice.reject_join_request(request.id).await.unwrap());

    let reply = mallory
        .wait_for_join_approval(request.id, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert!(!reply.approved);
    assert!(reply.sync_token.is_none());
    assert!(matches!(
        mallory.complete_join(&reply, SETTLE_TIMEOUT).await,
        Err(EngineError::JoinRejected(id)) if id == request.id
    ));
    assert!(mallory.family().family().unwrap().is_none());

    topology.shutdown().await;
}

#[tokio::test]
async fn used_token_is_refused() {
    init_tracing();
    let mut topology = FamilyTopology::new();
    let alice = topology.add_device("Alice").await.unwrap();
    let acme = alice.create_family("Acme").await.unwrap();
    let bob = topology.add_device("Bob").await.unwrap();
    admit(&alice, &bob, acme.id, Role::Member).await.unwrap();

    let issued = alice.family().issued_invitations().await.unwrap();
    assert_eq!(issued.len(), 1);
    let token = issued[0].token.clone();

    assert!(matches!(
        bob.family().join(&token).await,
        Err(FamilyError::InvalidToken)
    ));
    assert!(bob.family().pending_join_token().await.unwrap().is_none());

    topology.shutdown().await;
}

/// Carol overhears the approval sent to Bob and races him with its token.
#[tokio::test]
async fn approval_token_admits_only_its_requester() {
    init_tracing();
    let mut topology = FamilyTopology::new();
    let alice = topology.add_device("Alice").await.unwrap();
    let acme = alice.create_family("Acme").await.unwrap();
    let bob = topology.add_device("Bob").await.unwrap();
    let carol = topology.add_device("Carol").await.unwrap();

    wait_until("family advertisement", || {
        !bob.discovery().get_discovered_families().is_empty()
    })
    .await
    .unwrap();
    let request = bob.request_join(acme.id).await.unwrap();
    wait_until("join request at admin", || {
        alice.discovery().get_pending_join_requests().len() == 1
    })
    .await
    .unwrap();
    alice.approve_join_request(request.id, Role::Member).await.unwrap();
    let approval = bob
        .wait_for_join_approval(request.id, SETTLE_TIMEOUT)
        .await
        .unwrap();

    assert!(matches!(
        carol.complete_join(&approval, Duration::from_millis(500)).await,
        Err(EngineError::Timeout(_))
    ));
    let state = bob.complete_join(&approval, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(state.role_of(&bob.device_id()), Some(Role::Member));

    let token = approval.sync_token.as_deref().unwrap();
    assert!(matches!(
        carol.family().join(token).await,
        Err(FamilyError::InvalidToken)
    ));
    let at_admin = alice.family().get_family_state().unwrap().unwrap();
    assert_eq!(at_admin.role_of(&carol.device_id()), None);
    assert_eq!(at_admin.role_of(&bob.device_id()), Some(Role::Member));

    topology.shutdown().await;
}

#[tokio::test]
async fn join_request_needs_a_discovered_family() {
    init_tracing();
    let mut topology = FamilyTopology::new();
    let bob = topology.add_device("Bob").await.unwrap();

    let unknown = FamilyId::new();
    assert!(matches!(
        bob.request_join(unknown).await,
        Err(EngineError::Discovery(DiscoveryError::UnknownFamily(id))) if id == unknown
    ));

    topology.shutdown().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    init_tracing();
    let mut topology = FamilyTopology::new();
    let alice = topology.add_device("Alice").await.unwrap();
    let acme = alice.create_family("Acme").await.unwrap();
    let bob = topology.add_device("Bob").await.unwrap();
    wait_until("family advertisement", || {
        !bob.discovery().get_discovered_families().is_empty()
    })
    .await
    .unwrap();

    let request = bob.request_join(acme.id).await.unwrap();
    assert!(matches!(
        bob.wait_for_join_approval(request.id, Duration::from_millis(200))
            .await,
        Err(EngineError::Timeout(_))
    ));

    topology.shutdown().await;
}
