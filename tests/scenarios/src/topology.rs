//! In-process family topology.
//!
//! Every device is a full [`SyncEngine`] with its own in-memory store, all
//! attached to one [`MemoryNetwork`] for links and one [`MemoryLan`] for
//! discovery beacons.

use std::sync::Arc;
use std::time::Duration;
use sync_client::{Config, EngineError, MemoryLan, MemoryNetwork, SyncEngine};
use sync_doc::{DocumentError, FamilyState, MemoryStore};
use sync_types::{Family, FamilyId, Role};
use thiserror::Error;
use tracing::info;

use crate::assertions::DeviceSnapshot;

/// How long a scenario waits for the network before failing.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors that can occur while driving a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A device failed
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Reading a replica failed
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// Condition not reached in time
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// A family needs at least its admin
    #[error("no devices given")]
    NoDevices,
}

/// Engine configuration with timings suited to in-process scenarios.
pub fn scenario_config(name: &str) -> Config {
    let mut config = Config::default();
    config.device.name = name.to_string();
    config.sync.listen_port = 0;
    config.sync.status_throttle_ms = 50;
    config.sync.init_retry_ms = 20;
    config.sync.flush_interval_ms = 100;
    config.sync.reconnect_base_ms = 20;
    config.sync.reconnect_jitter_ms = 0;
    config.sync.reconnect_cap_secs = 1;
    config.sync.max_reconnect_attempts = 6;
    config.discovery.announce_interval_secs = 1;
    config.shutdown.timeout_secs = 2;
    config
}

/// Poll `check` until it holds or [`SETTLE_TIMEOUT`] passes.
pub async fn wait_until(
    what: &str,
    mut check: impl FnMut() -> bool,
) -> Result<(), TopologyError> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return Err(TopologyError::Timeout(what.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

/// Devices sharing one in-memory network and LAN.
#[derive(Default)]
pub struct FamilyTopology {
    network: MemoryNetwork,
    lan: MemoryLan,
    devices: Vec<SyncEngine>,
}

impl FamilyTopology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Found a family: the first name becomes the admin, every other device
    /// joins as a member. Returns once all devices are linked to each other.
    pub async fn family(
        family_name: &str,
        device_names: &[&str],
    ) -> Result<(Self, Family), TopologyError> {
        let mut topology = Self::new();
        let (admin_name, members) = device_names
            .split_first()
            .ok_or(TopologyError::NoDevices)?;

        let admin = topology.add_device(admin_name).await?;
        let family = admin.create_family(family_name).await?;
        for name in members {
            let device = topology.add_device(name).await?;
            admit(&admin, &device, family.id, Role::Member).await?;
        }
        topology.wait_fully_linked().await?;
        info!(family = family_name, devices = device_names.len(), "topology ready");
        Ok((topology, family))
    }

    /// Shared link network, for cutting links.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Open and start a new device.
    pub async fn add_device(&mut self, name: &str) -> Result<SyncEngine, TopologyError> {
        let engine = SyncEngine::open(
            scenario_config(name),
            Arc::new(MemoryStore::new()),
            Arc::new(self.network.connector()),
            Arc::new(self.lan.advertiser()),
        )
        .await?;
        engine.start();
        self.devices.push(engine.clone());
        Ok(engine)
    }

    /// Device `index`, in the order devices were added.
    pub fn device(&self, index: usize) -> &SyncEngine {
        &self.devices[index]
    }

    /// All devices.
    pub fn devices(&self) -> &[SyncEngine] {
        &self.devices
    }

    /// Current document of every device.
    pub fn snapshot(&self) -> Result<Vec<DeviceSnapshot>, TopologyError> {
        self.devices
            .iter()
            .map(|d| {
                Ok(DeviceSnapshot {
                    name: d.device_name().to_string(),
                    document: d.manager().document_state()?,
                })
            })
            .collect()
    }

    /// Wait until every device is connected to every other device.
    pub async fn wait_fully_linked(&self) -> Result<(), TopologyError> {
        let others = self.devices.len().saturating_sub(1);
        wait_until("every device linked to every other", || {
            self.devices
                .iter()
                .all(|d| d.coordinator().get_connected_peers().len() == others)
        })
        .await
    }

    /// Wait until every replica holds the same document.
    pub async fn wait_converged(&self) -> Result<(), TopologyError> {
        wait_until("replicas to converge", || {
            self.snapshot()
                .map(|s| crate::assertions::assert_converged(&s).passed)
                .unwrap_or(false)
        })
        .await
    }

    /// Shut every device down.
    pub async fn shutdown(&self) {
        for device in &self.devices {
            device.shutdown().await;
        }
    }
}

/// Walk `joiner` through the join handshake with `admin`.
///
/// The joiner finds the family advertisement, sends a request and the admin
/// approves it with `role`. The joiner then links to the family presenting
/// the token, which the admin redeems, and confirms once its grant synced.
pub async fn admit(
    admin: &SyncEngine,
    joiner: &SyncEngine,
    family_id: FamilyId,
    role: Role,
) -> Result<FamilyState, TopologyError> {
    wait_until("family advertisement", || {
        joiner
            .discovery()
            .get_discovered_families()
            .iter()
            .any(|f| f.family_id == family_id)
    })
    .await?;

    let request = joiner.request_join(family_id).await?;
    wait_until("join request at admin", || {
        admin
            .discovery()
            .get_pending_join_requests()
            .iter()
            .any(|r| r.id == request.id)
    })
    .await?;

    admin.approve_join_request(request.id, role).await?;
    let approval = joiner
        .wait_for_join_approval(request.id, SETTLE_TIMEOUT)
        .await?;
    Ok(joiner.complete_join(&approval, SETTLE_TIMEOUT).await?)
}
