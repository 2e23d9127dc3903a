//! Run the sync daemon.

use anyhow::Result;
use std::path::Path;
use sync_client::{Config, DiscoveryEvent, ShutdownOutcome, SyncEvent};
use sync_types::Role;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::open_engine;

/// Run the daemon until Ctrl-C.
///
/// With `auto_approve`, every join request is approved with that role.
pub async fn run(data_dir: &Path, config: Config, auto_approve: Option<Role>) -> Result<()> {
    let (store, engine) = open_engine(data_dir, config).await?;
    let mut sync_events = engine.coordinator().subscribe();
    let mut discovery_events = engine.discovery().subscribe();
    engine.start();
    info!(
        device_id = %engine.device_id(),
        name = engine.device_name(),
        "daemon running, Ctrl-C to stop"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "signal handler failed");
                }
                break;
            }
            event = sync_events.recv() => match event {
                Ok(event) => log_sync_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            event = discovery_events.recv() => match event {
                Ok(DiscoveryEvent::JoinRequestReceived(request)) => match auto_approve {
                    Some(role) => {
                        let device = &request.device_name;
                        match engine.approve_join_request(request.id, role).await {
                            Ok(_) => info!(%device, %role, "join request approved"),
                            Err(e) => warn!(%device, error = %e, "join approval failed"),
                        }
                    }
                    None => info!(
                        device = %request.device_name,
                        request_id = %request.id,
                        "join request pending, restart with --auto-approve <role> to admit"
                    ),
                },
                Ok(DiscoveryEvent::FamilyDiscovered(family)) => {
                    info!(family = %family.name, id = %family.family_id, "family on network");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("shutting down");
    if engine.shutdown().await == ShutdownOutcome::TimedOut {
        warn!("shutdown timed out, exiting anyway");
    }
    store.close().await;
    Ok(())
}

fn log_sync_event(event: &SyncEvent) {
    match event {
        SyncEvent::StatusChanged(status) => {
            info!(
                status = ?status.status,
                peers = status.peer_count,
                error = ?status.error,
                "sync status"
            );
        }
        SyncEvent::PeerConnected(peer) => {
            info!(device = %peer.device_name, device_id = %peer.device_id, "peer connected");
        }
        SyncEvent::PeerDisconnected { device_id, reason } => {
            info!(%device_id, %reason, "peer disconnected");
        }
        SyncEvent::PeerDiscovered(_) | SyncEvent::AwarenessChanged { .. } => {}
    }
}
