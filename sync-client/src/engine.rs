//! Sync engine: the replica manager, family service, coordinator and
//! discovery wired together for one device.
//!
//! [`SyncEngine::open`] loads the device identity and the persisted document
//! and makes the device visible on the local network. [`SyncEngine::start`]
//! then brings sync up in the background:
//!
//! ```text
//! open ──► start ──► initialize (retry until a family exists)
//!                        │
//!                        ▼
//!               coordinator.start ──► announce link port + family
//!                        │
//!                        ▼
//!         discovered devices of the same family ──► add_candidate
//! ```
//!
//! [`SyncEngine::shutdown`] stops sync and discovery before closing the
//! document, all within the configured time budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_doc::{
    DeviceIdentity, DocumentError, DocumentReplicaManager, FamilyError, FamilyService,
    FamilyState, KeyValueStore, RandomTokens, StoreError,
};
use sync_types::{
    DeviceId, Family, FamilyId, Invitation, JoinApproval, JoinRequest, RequestId, Role,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::coordinator::{CoordinatorConfig, CoordinatorError, PeerSyncCoordinator};
use crate::discovery::{
    Advertiser, DiscoveryError, DiscoveryEvent, DiscoveryService, DiscoveryTiming,
};
use crate::transport::Connector;

/// How often a joining device checks whether the admin redeemed its token.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Key-value store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Document failure.
    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// Family management failure.
    #[error(transparent)]
    Family(#[from] FamilyError),

    /// Coordinator failure.
    #[error("sync error: {0}")]
    Sync(#[from] CoordinatorError),

    /// Discovery failure.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The admin turned the join request down.
    #[error("join request {0} was rejected")]
    JoinRejected(RequestId),

    /// Waiting for the network took too long.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The engine was shut down.
    #[error("engine shut down")]
    Closed,
}

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every service stopped and the document was flushed and closed.
    Completed,
    /// The time budget ran out first. Unflushed changes may be lost.
    TimedOut,
}

/// All sync services of one device.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: Arc<dyn KeyValueStore>,
    device_id: DeviceId,
    device_name: String,
    manager: Arc<DocumentReplicaManager>,
    family: FamilyService,
    coordinator: PeerSyncCoordinator,
    discovery: DiscoveryService,
    started: AtomicBool,
    bringing_up: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncEngine {
    /// Load the device identity and document, and announce the device.
    ///
    /// Nothing syncs until [`start`](Self::start).
    pub async fn open(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn Connector>,
        advertiser: Arc<dyn Advertiser>,
    ) -> Result<Self, EngineError> {
        let identity = DeviceIdentity::load_or_create(store.as_ref(), &config.device.name).await?;
        let manager = Arc::new(DocumentReplicaManager::new(
            identity.device_id,
            Arc::clone(&store),
        ));
        manager.initialize().await?;

        let family = FamilyService::new(
            Arc::clone(&manager),
            Arc::clone(&store),
            Arc::new(RandomTokens),
            identity.device_name.clone(),
        );
        let coordinator =
            PeerSyncCoordinator::new(connector, CoordinatorConfig::from(&config.sync));
        // A join interrupted by a restart resumes presenting its token.
        coordinator.set_join_token(family.pending_join_token().await?);
        let discovery = DiscoveryService::new(advertiser, DiscoveryTiming::from(&config.discovery));
        if config.discovery.enabled {
            discovery.initialize_basic(identity.device_id, identity.device_name.clone());
            discovery.set_member_family(identity.family_id);
        }

        info!(
            device_id = %identity.device_id,
            name = %identity.device_name,
            family_id = ?identity.family_id,
            "sync engine opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                device_id: identity.device_id,
                device_name: identity.device_name,
                manager,
                family,
                coordinator,
                discovery,
                started: AtomicBool::new(false),
                bringing_up: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start discovery, periodic flushing and sync. Returns immediately.
    ///
    /// Sync comes up in the background once a family exists; until then the
    /// coordinator keeps retrying on the configured schedule.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = Vec::new();
        if self.inner.config.discovery.enabled {
            if let Err(e) = self.inner.discovery.start_discovering() {
                warn!(error = %e, "discovery not started");
            }
            let events = self.inner.discovery.subscribe();
            tasks.push(tokio::spawn(feed_candidates(Arc::clone(&self.inner), events)));
        }
        tasks.push(tokio::spawn(flush_periodically(Arc::clone(&self.inner))));
        lock(&self.inner.tasks).extend(tasks);
        self.inner.ensure_sync();
        info!("sync engine started");
    }

    /// This device.
    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Name this device goes by.
    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The replicated document.
    pub fn manager(&self) -> &Arc<DocumentReplicaManager> {
        &self.inner.manager
    }

    /// Family management for this device.
    pub fn family(&self) -> &FamilyService {
        &self.inner.family
    }

    /// Peer sync.
    pub fn coordinator(&self) -> &PeerSyncCoordinator {
        &self.inner.coordinator
    }

    /// Local-network discovery.
    pub fn discovery(&self) -> &DiscoveryService {
        &self.inner.discovery
    }

    /// Create a family with this device as admin and start publishing it.
    pub async fn create_family(&self, name: &str) -> Result<Family, EngineError> {
        let family = self.inner.family.create_family(name).await?;
        self.inner.manager.flush().await?;
        if self.inner.discovery.is_initialized() {
            self.inner.discovery.set_member_family(Some(family.id));
        }
        self.inner.ensure_sync();
        Ok(family)
    }

    /// Ask the admin publishing `family_id` to let this device in.
    pub async fn request_join(&self, family_id: FamilyId) -> Result<JoinRequest, EngineError> {
        Ok(self.inner.discovery.send_join_request(family_id).await?)
    }

    /// Wait for the admin's answer to one of our join requests.
    pub async fn wait_for_join_approval(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<JoinApproval, EngineError> {
        let mut events = self.inner.discovery.subscribe();
        let wait = async {
            loop {
                if let Some(approval) = self.inner.discovery.join_approval(request_id) {
                    return Ok(approval);
                }
                match events.recv().await {
                    Ok(DiscoveryEvent::JoinApprovalReceived(approval))
                        if approval.request_id == request_id =>
                    {
                        return Ok(approval)
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(EngineError::Closed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| EngineError::Timeout("join approval"))?
    }

    /// Approve a pending join request and send the requester a token. Admin only.
    pub async fn approve_join_request(
        &self,
        request_id: RequestId,
        role: Role,
    ) -> Result<JoinApproval, EngineError> {
        let family = self.admin_family("approve join requests")?;
        let approval = self.inner.discovery.approve_join_request(
            request_id,
            role,
            family.id,
            &family.name,
        )?;
        let requester = self
            .inner
            .discovery
            .requester(request_id)
            .ok_or(DiscoveryError::UnknownRequest(request_id))?;
        let approval = self
            .inner
            .family
            .issue_join_approval(approval, requester)
            .await?;
        self.inner.discovery.send_join_approval(&approval).await?;
        Ok(approval)
    }

    /// Reject a pending join request and tell the requester. Admin only.
    ///
    /// Returns `false` if the request was not pending.
    pub async fn reject_join_request(&self, request_id: RequestId) -> Result<bool, EngineError> {
        let family = self.admin_family("reject join requests")?;
        if !self.inner.discovery.reject_join_request(request_id) {
            return Ok(false);
        }
        let reply = JoinApproval {
            request_id,
            approved: false,
            role: Role::Member,
            family_id: family.id,
            family_name: family.name,
            sync_token: None,
        };
        if let Err(e) = self.inner.discovery.send_join_approval(&reply).await {
            warn!(%request_id, error = %e, "rejection not delivered");
        }
        Ok(true)
    }

    /// Join the family named in an approval.
    ///
    /// Adopts the family and links to its devices presenting the approval's
    /// token. Completes once the admin has redeemed the token for this device
    /// and the grant has synced back.
    pub async fn complete_join(
        &self,
        approval: &JoinApproval,
        timeout: Duration,
    ) -> Result<FamilyState, EngineError> {
        if !approval.approved {
            return Err(EngineError::JoinRejected(approval.request_id));
        }
        let token = approval
            .sync_token
            .clone()
            .ok_or(FamilyError::UnusableApproval("no token attached"))?;
        self.inner.family.prepare_join(approval).await?;
        self.inner.coordinator.set_join_token(Some(token.clone()));
        if self.inner.discovery.is_initialized() {
            self.inner.discovery.set_member_family(Some(approval.family_id));
        }
        self.inner.ensure_sync();

        tokio::time::timeout(timeout, self.invitation_redeemed(&token))
            .await
            .map_err(|_| EngineError::Timeout("admission by the admin"))??;

        let state = self.inner.family.join(&token).await?;
        self.inner.coordinator.set_join_token(None);
        self.inner.manager.flush().await?;
        Ok(state)
    }

    /// Request to join `family_id`, wait for the admin and complete the join.
    pub async fn join_family(
        &self,
        family_id: FamilyId,
        timeout: Duration,
    ) -> Result<FamilyState, EngineError> {
        let request = self.request_join(family_id).await?;
        let approval = self.wait_for_join_approval(request.id, timeout).await?;
        self.complete_join(&approval, timeout).await
    }

    /// Force the document open again and restart sync.
    ///
    /// Clears a stale lock left by a crashed process. Unflushed local changes
    /// are discarded.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.inner.coordinator.stop().await?;
        if self.inner.manager.is_initialized() {
            self.inner.manager.force_unlock().await?;
        } else {
            self.inner.manager.initialize_with_recovery().await?;
        }
        info!("document reset");
        self.inner.ensure_sync();
        Ok(())
    }

    /// Stop sync and discovery, then flush and close the document.
    ///
    /// Bounded by the configured shutdown timeout. A second call does nothing.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return ShutdownOutcome::Completed;
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }

        let inner = &self.inner;
        let orderly = async {
            tokio::join!(inner.coordinator.destroy(), inner.discovery.shutdown());
            if let Err(e) = inner.manager.close().await {
                error!(error = %e, "closing document failed");
            }
        };
        let budget = Duration::from_secs(inner.config.shutdown.timeout_secs);
        match tokio::time::timeout(budget, orderly).await {
            Ok(()) => {
                info!("sync engine shut down");
                ShutdownOutcome::Completed
            }
            Err(_) => {
                warn!(?budget, "shutdown timed out");
                ShutdownOutcome::TimedOut
            }
        }
    }

    fn admin_family(&self, action: &'static str) -> Result<Family, EngineError> {
        let family = self.inner.family.family()?.ok_or(FamilyError::NoFamily)?;
        if !self.inner.family.is_admin()? {
            return Err(FamilyError::NotAdmin(action).into());
        }
        Ok(family)
    }

    async fn invitation_redeemed(&self, token: &str) -> Result<(), EngineError> {
        let mut poll = tokio::time::interval(JOIN_POLL_INTERVAL);
        loop {
            poll.tick().await;
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(EngineError::Closed);
            }
            let doc = self.inner.manager.get_structure()?;
            let invitation = doc.invitations.get_as::<Invitation>(token)?;
            if invitation.is_some_and(|i| i.used_by == Some(self.inner.device_id)) {
                debug!("invitation redeemed for this device");
                return Ok(());
            }
        }
    }
}

impl Inner {
    /// Bring sync up in the background unless it is running or on its way.
    fn ensure_sync(self: &Arc<Self>) {
        if !self.started.load(Ordering::SeqCst)
            || self.closed.load(Ordering::SeqCst)
            || self.coordinator.is_active()
            || self.bringing_up.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let task = tokio::spawn(bring_up(Arc::clone(self)));
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn go_online(&self, identity: DeviceIdentity) -> Result<(), EngineError> {
        self.coordinator.start().await?;
        let Some(family_id) = identity.family_id else {
            return Ok(());
        };
        if !self.discovery.is_initialized() {
            return Ok(());
        }

        self.discovery
            .set_link_port(self.coordinator.local_port().unwrap_or(0));
        self.discovery.set_member_family(Some(family_id));
        if self.family.is_admin()? {
            if let Some(family) = self.family.family()? {
                self.discovery.start_family_publishing(family.id, &family.name)?;
            }
        }
        for peer in self.discovery.family_peers(family_id) {
            self.coordinator.add_candidate(peer);
        }
        Ok(())
    }
}

async fn bring_up(inner: Arc<Inner>) {
    let policy = inner.config.sync.init_retry_policy();
    let result = match inner
        .coordinator
        .initialize_with_retry(
            inner.store.as_ref(),
            &inner.config.device.name,
            Arc::clone(&inner.manager),
            &policy,
        )
        .await
    {
        Ok(identity) => inner.go_online(identity).await,
        Err(e) => Err(e.into()),
    };
    inner.bringing_up.store(false, Ordering::SeqCst);
    match result {
        Ok(()) => info!("sync online"),
        Err(e) => warn!(error = %e, "sync not started"),
    }
}

/// Hand discovered devices of our family to the coordinator.
async fn feed_candidates(inner: Arc<Inner>, mut events: broadcast::Receiver<DiscoveryEvent>) {
    loop {
        match events.recv().await {
            Ok(DiscoveryEvent::DeviceDiscovered(device)) => {
                let ours = inner.discovery.member_family();
                if ours.is_some() && device.member_of == ours && device.peer.port != 0 {
                    inner.coordinator.add_candidate(device.peer);
                }
            }
            Ok(DiscoveryEvent::DeviceLost(device_id)) => {
                inner.coordinator.remove_candidate(&device_id);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "discovery events lagged, rescanning");
                if let Some(family_id) = inner.discovery.member_family() {
                    for peer in inner.discovery.family_peers(family_id) {
                        inner.coordinator.add_candidate(peer);
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn flush_periodically(inner: Arc<Inner>) {
    let period = Duration::from_millis(inner.config.sync.flush_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match inner.manager.flush().await {
            Ok(true) => debug!("document flushed"),
            Ok(false) => {}
            Err(DocumentError::NotInitialized) => break,
            // Logged by the manager; the snapshot stays dirty for the next tick.
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryLan;
    use crate::transport::MemoryNetwork;
    use sync_doc::MemoryStore;

    fn test_config(name: &str) -> Config {
        let mut config = Config::default();
        config.device.name = name.to_string();
        config.sync.listen_port = 0;
        config.sync.init_retry_ms = 20;
        config.sync.status_throttle_ms = 20;
        config.sync.flush_interval_ms = 50;
        config.discovery.announce_interval_secs = 1;
        config.shutdown.timeout_secs = 2;
        config
    }

    async fn open(network: &MemoryNetwork, lan: &MemoryLan, name: &str) -> SyncEngine {
        SyncEngine::open(
            test_config(name),
            Arc::new(MemoryStore::new()),
            Arc::new(network.connector()),
            Arc::new(lan.advertiser()),
        )
        .await
        .unwrap()
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn open_loads_identity_and_document() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let network = MemoryNetwork::new();
        let lan = MemoryLan::new();

        let engine = SyncEngine::open(
            test_config("Kitchen"),
            Arc::clone(&store),
            Arc::new(network.connector()),
            Arc::new(lan.advertiser()),
        )
        .await
        .unwrap();

        assert!(engine.manager().is_initialized());
        assert!(engine.discovery().is_initialized());
        assert_eq!(engine.device_name(), "Kitchen");
        assert!(engine.family().family().unwrap().is_none());
        assert!(!engine.coordinator().is_active());

        let identity = DeviceIdentity::load_or_create(store.as_ref(), "other").await.unwrap();
        assert_eq!(identity.device_id, engine.device_id());
    }

    #[tokio::test]
    async fn create_family_brings_sync_up() {
        let network = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let engine = open(&network, &lan, "Admin").await;

        engine.start();
        let family = engine.create_family("Acme").await.unwrap();

        eventually("sync to start", || engine.coordinator().is_active()).await;
        eventually("family to be published", || engine.discovery().is_publishing()).await;
        assert_eq!(engine.discovery().member_family(), Some(family.id));
        assert!(engine.coordinator().local_port().is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn family_members_only_can_approve() {
        let network = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let engine = open(&network, &lan, "Lonely").await;

        let result = engine
            .approve_join_request(RequestId::new(), Role::Member)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Family(FamilyError::NoFamily))
        ));
    }

    #[tokio::test]
    async fn rejected_approval_cannot_complete_join() {
        let network = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let engine = open(&network, &lan, "Guest").await;

        let approval = JoinApproval {
            request_id: RequestId::new(),
            approved: false,
            role: Role::Member,
            family_id: FamilyId::new(),
            family_name: "Acme".into(),
            sync_token: None,
        };
        let result = engine
            .complete_join(&approval, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(EngineError::JoinRejected(id)) if id == approval.request_id));
    }

    #[tokio::test]
    async fn shutdown_closes_document_once() {
        let network = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let engine = open(&network, &lan, "Admin").await;
        engine.start();
        engine.create_family("Acme").await.unwrap();

        assert_eq!(engine.shutdown().await, ShutdownOutcome::Completed);
        assert!(!engine.manager().is_initialized());
        assert!(!engine.coordinator().is_active());
        assert_eq!(engine.shutdown().await, ShutdownOutcome::Completed);
    }

    #[tokio::test]
    async fn reset_reopens_document_and_keeps_data() {
        let network = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let engine = open(&network, &lan, "Admin").await;
        let family = engine.create_family("Acme").await.unwrap();

        engine.reset().await.unwrap();

        assert!(engine.manager().is_initialized());
        assert_eq!(engine.family().family().unwrap(), Some(family));
    }
}
