//! Peer Sync Coordinator.
//!
//! Keeps live links to the other devices of a family and moves document
//! updates across them. The coordinator interprets two pure state machines
//! from sync-core: [`CoordinatorState`] for its own lifecycle and one
//! [`PeerLinkState`] per remote device.
//!
//! # Architecture
//!
//! ```text
//! DocumentReplicaManager ──updates──► forwarder ──► link task (per peer) ──► Transport
//!          ▲                                             │
//!          └──────── apply_remote_update ◄───────────────┘
//! ```
//!
//! Each link runs in its own task; a failure on one link only drives that
//! peer's state machine into reconnection. Status changes are collapsed by a
//! [`StatusThrottle`] before they reach subscribers.
//!
//! # Protocol
//!
//! Both ends send `Hello` with their state vector, then answer with
//! `SyncStep2` carrying what the other side lacks. Later local changes travel
//! as `Update { seq }` and are kept in an [`UpdateBuffer`] until the peer
//! acknowledges them with `Ack { seq, state_vector }`.
//!
//! A `Hello` is checked twice before any document data flows: it must name
//! this family and the expected device, and the device must be admitted by
//! [`admit_peer`]. A joining device carries its invitation token in `Hello`
//! and the admin redeems it there. Messages larger than one frame travel as
//! `Chunk` pieces and are reassembled per link.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use sync_core::{
    split_message, BufferError, CoordinatorState, LifecycleError, LinkAction, LinkEvent,
    LinkNotice, PeerLinkState, Reassembler, ReconnectPolicy, RetryPolicy, StatusThrottle,
    UpdateBuffer, CHUNK_SIZE, DEFAULT_STATUS_WINDOW,
};
use sync_doc::{
    admit_peer, Admission, DeviceIdentity, DocumentError, DocumentReplicaManager,
    DocumentUpdate, KeyValueStore, StoreError, UpdateOrigin,
};
use sync_types::{
    now_millis, DeviceId, DiscoveredPeer, FamilyId, Hello, PeerConnection, PeerMessage,
    PeerStatus, SyncState, SyncStatus, Timestamp, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::transport::{Connector, Listener, Transport, TransportError, MAX_MESSAGE_SIZE};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No family is configured yet. Retry once one exists.
    #[error("no family configured")]
    MissingFamily,

    /// The coordinator or its document is not initialized.
    #[error("not initialized")]
    NotInitialized,

    /// The coordinator was destroyed.
    #[error("coordinator destroyed")]
    Destroyed,

    /// Reading the device identity failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Bounded initialization retry ran out of attempts.
    #[error("initialization failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<CoordinatorError>,
    },
}

impl From<LifecycleError> for CoordinatorError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotInitialized => CoordinatorError::NotInitialized,
            LifecycleError::Destroyed => CoordinatorError::Destroyed,
        }
    }
}

/// Events pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Aggregate status changed (throttled).
    StatusChanged(SyncStatus),
    /// Handshake with a peer completed.
    PeerConnected(PeerConnection),
    /// A connected peer went away.
    PeerDisconnected {
        /// Remote device.
        device_id: DeviceId,
        /// Why the link ended.
        reason: String,
    },
    /// A new candidate peer was reported by discovery.
    PeerDiscovered(DiscoveredPeer),
    /// A peer's presence state changed. `None` once it is gone.
    AwarenessChanged {
        /// Remote device.
        device_id: DeviceId,
        /// Latest presence state.
        state: Option<Value>,
    },
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Port to accept links on (0 picks a free port).
    pub listen_port: u16,
    /// Window collapsing status events.
    pub status_window: Duration,
    /// Silence after which a connected peer is evicted.
    pub peer_timeout: Duration,
    /// Interval between presence heartbeats on each link.
    pub keepalive_interval: Duration,
    /// Time allowed for the remote `Hello`.
    pub hello_timeout: Duration,
    /// Reconnect schedule for lost peers.
    pub reconnect: ReconnectPolicy,
    /// Unacknowledged updates kept per peer.
    pub buffer_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for CoordinatorConfig {
    fn from(config: &SyncConfig) -> Self {
        let peer_timeout = Duration::from_secs(config.peer_timeout_secs);
        let status_window = match config.status_throttle_ms {
            0 => DEFAULT_STATUS_WINDOW,
            ms => Duration::from_millis(ms),
        };
        Self {
            listen_port: config.listen_port,
            status_window,
            peer_timeout,
            keepalive_interval: peer_timeout / 3,
            hello_timeout: Duration::from_secs(config.hello_timeout_secs),
            reconnect: config.reconnect_policy(),
            buffer_capacity: config.update_buffer_capacity,
        }
    }
}

/// Identity and document a coordinator syncs.
#[derive(Clone)]
struct Session {
    device_id: DeviceId,
    device_name: String,
    family_id: FamilyId,
    manager: Arc<DocumentReplicaManager>,
}

impl Session {
    fn hello(&self, sync_token: Option<String>) -> Result<PeerMessage, DocumentError> {
        Ok(PeerMessage::Hello(Hello {
            version: PROTOCOL_VERSION,
            device_id: self.device_id,
            device_name: self.device_name.clone(),
            family_id: self.family_id,
            state_vector: self.manager.get_state_vector()?,
            sync_token,
        }))
    }
}

enum LinkCommand {
    Update(Vec<u8>),
    Resync,
    Awareness(String),
    Close,
}

struct PeerEntry {
    info: PeerConnection,
    link: PeerLinkState,
    candidate: Option<DiscoveredPeer>,
    outbound: bool,
    generation: u64,
    commands: Option<mpsc::UnboundedSender<LinkCommand>>,
    task: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    last_heard: Instant,
}

impl PeerEntry {
    fn new(device_id: DeviceId, device_name: String, generation: u64) -> Self {
        Self {
            info: PeerConnection {
                device_id,
                device_name,
                status: PeerStatus::Discovered,
                last_seen: now_millis(),
                last_sync_at: None,
            },
            link: PeerLinkState::new(),
            candidate: None,
            outbound: false,
            generation,
            commands: None,
            task: None,
            retry: None,
            last_heard: Instant::now(),
        }
    }
}

fn peer_status(link: &PeerLinkState) -> PeerStatus {
    match link {
        PeerLinkState::Discovered => PeerStatus::Discovered,
        PeerLinkState::Connected => PeerStatus::Connected,
        PeerLinkState::Closed => PeerStatus::Disconnected,
        PeerLinkState::Connecting
        | PeerLinkState::Handshaking
        | PeerLinkState::Reconnecting { .. } => PeerStatus::Connecting,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Inner {
    config: CoordinatorConfig,
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<CoordinatorState>,
    session: Mutex<Option<Session>>,
    peers: DashMap<DeviceId, PeerEntry>,
    discovered: Mutex<HashMap<DeviceId, DiscoveredPeer>>,
    events: broadcast::Sender<SyncEvent>,
    throttle: Mutex<StatusThrottle<SyncStatus>>,
    flush_scheduled: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_sync_at: Mutex<Option<Timestamp>>,
    awareness: Mutex<Option<String>>,
    remote_awareness: DashMap<DeviceId, Value>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_port: Mutex<Option<u16>>,
    generation: AtomicU64,
    join_token: Mutex<Option<String>>,
    // Serializes invitation redemption across links.
    admission: Mutex<()>,
}

/// Keeps a family document in sync with connected peers.
#[derive(Clone)]
pub struct PeerSyncCoordinator {
    inner: Arc<Inner>,
}

impl PeerSyncCoordinator {
    /// Create a coordinator that opens links through `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let throttle = StatusThrottle::new(config.status_window);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                lifecycle: Mutex::new(CoordinatorState::default()),
                session: Mutex::new(None),
                peers: DashMap::new(),
                discovered: Mutex::new(HashMap::new()),
                events,
                throttle: Mutex::new(throttle),
                flush_scheduled: AtomicBool::new(false),
                last_error: Mutex::new(None),
                last_sync_at: Mutex::new(None),
                awareness: Mutex::new(None),
                remote_awareness: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
                local_port: Mutex::new(None),
                generation: AtomicU64::new(0),
                join_token: Mutex::new(None),
                admission: Mutex::new(()),
            }),
        }
    }

    /// Bind the coordinator to a device identity and a loaded document.
    ///
    /// Fails with [`CoordinatorError::MissingFamily`] while the device has no
    /// family; the caller retries once one exists (see
    /// [`initialize_with_retry`](Self::initialize_with_retry)). Calling it
    /// while sync is running is a no-op.
    pub async fn initialize(
        &self,
        identity: &DeviceIdentity,
        manager: Arc<DocumentReplicaManager>,
    ) -> Result<(), CoordinatorError> {
        {
            let mut state = lock(&self.inner.lifecycle);
            let next = state.begin_initialize()?;
            if next.is_active() {
                return Ok(());
            }
            *state = next;
        }

        let result = match identity.family_id {
            None => Err(CoordinatorError::MissingFamily),
            Some(_) if !manager.is_initialized() => Err(CoordinatorError::NotInitialized),
            Some(family_id) => Ok(Session {
                device_id: identity.device_id,
                device_name: identity.device_name.clone(),
                family_id,
                manager,
            }),
        };

        let mut state = lock(&self.inner.lifecycle);
        match result {
            Ok(session) => {
                info!(
                    device_id = %session.device_id,
                    family_id = %session.family_id,
                    "sync coordinator initialized"
                );
                *lock(&self.inner.session) = Some(session);
                *state = state.finish_initialize(true);
                Ok(())
            }
            Err(e) => {
                *state = state.finish_initialize(false);
                Err(e)
            }
        }
    }

    /// [`initialize`](Self::initialize) with a bounded retry while the family
    /// or document is not ready yet.
    ///
    /// The identity is re-read from `store` on every attempt, so a family
    /// created or joined meanwhile is picked up.
    pub async fn initialize_with_retry(
        &self,
        store: &dyn KeyValueStore,
        device_name: &str,
        manager: Arc<DocumentReplicaManager>,
        policy: &RetryPolicy,
    ) -> Result<DeviceIdentity, CoordinatorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let identity = DeviceIdentity::load_or_create(store, device_name).await?;
            match self.initialize(&identity, manager.clone()).await {
                Ok(()) => return Ok(identity),
                Err(e @ (CoordinatorError::MissingFamily | CoordinatorError::NotInitialized)) => {
                    match policy.delay_after(attempt) {
                        Some(delay) => {
                            debug!(attempt, ?delay, reason = %e, "sync not ready, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(CoordinatorError::RetriesExhausted {
                                attempts: attempt,
                                last: Box::new(e),
                            })
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Start syncing. Starting an active coordinator is a no-op.
    ///
    /// Failures past the lifecycle checks are not returned: they are reported
    /// through [`SyncEvent::StatusChanged`] with `status: Offline` and the
    /// error set.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = lock(&self.inner.lifecycle);
            let next = state.start()?;
            if state.is_active() {
                return Ok(());
            }
            *state = next;
        }
        *lock(&self.inner.last_error) = None;
        self.inner.publish_status();

        let Some(session) = self.inner.session() else {
            self.inner.fail_start("no session".into());
            return Ok(());
        };
        if let Err(e) = session.manager.get_state_vector() {
            self.inner.fail_start(format!("document unavailable: {e}"));
            return Ok(());
        }
        let listener = match self.inner.connector.listen(self.inner.config.listen_port).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.fail_start(e.to_string());
                return Ok(());
            }
        };
        let port = listener.local_port();
        *lock(&self.inner.local_port) = Some(port);

        {
            let inner = &self.inner;
            let mut tasks = lock(&inner.tasks);
            tasks.push(tokio::spawn(accept_loop(Arc::clone(inner), listener)));
            tasks.push(tokio::spawn(forward_updates(
                Arc::clone(inner),
                session.manager.subscribe(),
            )));
            tasks.push(tokio::spawn(sweep_silent(Arc::clone(inner))));
        }
        info!(port, family_id = %session.family_id, "sync started");

        let candidates: Vec<DiscoveredPeer> =
            lock(&self.inner.discovered).values().cloned().collect();
        for candidate in candidates {
            self.inner.connect_candidate(&candidate);
        }
        self.inner.publish_status();
        Ok(())
    }

    /// Stop syncing and close every link. Stopping an idle coordinator is a no-op.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = lock(&self.inner.lifecycle);
            let next = state.stop()?;
            if !state.is_active() {
                return Ok(());
            }
            *state = next;
        }
        self.inner.teardown();
        info!("sync stopped");
        self.inner.publish_status();
        Ok(())
    }

    /// Tear down for good. Every later call fails with `Destroyed`.
    pub async fn destroy(&self) {
        {
            let mut state = lock(&self.inner.lifecycle);
            *state = state.destroy();
        }
        self.inner.teardown();
        lock(&self.inner.discovered).clear();
        *lock(&self.inner.session) = None;
        info!("sync coordinator destroyed");
        self.inner.publish_status();
    }

    /// Whether sync is running.
    pub fn is_active(&self) -> bool {
        lock(&self.inner.lifecycle).is_active()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CoordinatorState {
        *lock(&self.inner.lifecycle)
    }

    /// Port accepting peer links while active.
    pub fn local_port(&self) -> Option<u16> {
        *lock(&self.inner.local_port)
    }

    /// Push local state and presence to every connected peer now.
    ///
    /// Returns how many peers were nudged; zero peers is not an error.
    pub fn force_sync(&self) -> Result<usize, CoordinatorError> {
        let state = *lock(&self.inner.lifecycle);
        if state == CoordinatorState::Destroyed {
            return Err(CoordinatorError::Destroyed);
        }
        let awareness = self.inner.awareness_json();
        let mut nudged = 0;
        for entry in self.inner.peers.iter() {
            if let (true, Some(tx)) = (entry.link.is_connected(), entry.commands.as_ref()) {
                let _ = tx.send(LinkCommand::Resync);
                let _ = tx.send(LinkCommand::Awareness(awareness.clone()));
                nudged += 1;
            }
        }
        debug!(peers = nudged, "forced sync");
        Ok(nudged)
    }

    /// Unthrottled current status.
    pub fn get_status(&self) -> SyncStatus {
        self.inner.current_status()
    }

    /// Peers with a completed handshake.
    pub fn get_connected_peers(&self) -> Vec<PeerConnection> {
        let mut peers: Vec<PeerConnection> = self
            .inner
            .peers
            .iter()
            .filter(|e| e.link.is_connected())
            .map(|e| e.info.clone())
            .collect();
        peers.sort_by_key(|p| p.device_id.to_string());
        peers
    }

    /// Candidates reported by discovery that are not connected.
    pub fn get_discovered_peers(&self) -> Vec<DiscoveredPeer> {
        let discovered = lock(&self.inner.discovered);
        let mut peers: Vec<DiscoveredPeer> = discovered
            .values()
            .filter(|p| {
                !self
                    .inner
                    .peers
                    .get(&p.device_id)
                    .map(|e| e.link.is_connected())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.discovered_at);
        peers
    }

    /// Record a candidate peer and dial it when sync is running.
    pub fn add_candidate(&self, peer: DiscoveredPeer) {
        let own = lock(&self.inner.session).as_ref().map(|s| s.device_id);
        if own == Some(peer.device_id) {
            return;
        }
        let changed = {
            let mut discovered = lock(&self.inner.discovered);
            match discovered.get(&peer.device_id) {
                Some(known) if known.host == peer.host && known.port == peer.port => false,
                _ => {
                    discovered.insert(peer.device_id, peer.clone());
                    true
                }
            }
        };
        if changed {
            debug!(
                device_id = %peer.device_id,
                host = %peer.host,
                port = peer.port,
                "peer candidate"
            );
            self.inner.emit(SyncEvent::PeerDiscovered(peer.clone()));
        }
        if self.is_active() {
            self.inner.connect_candidate(&peer);
        }
    }

    /// Invitation token to present in `Hello` until the join is confirmed.
    ///
    /// Applies to links opened after the call.
    pub fn set_join_token(&self, token: Option<String>) {
        *lock(&self.inner.join_token) = token;
    }

    /// Forget a candidate. Live links are left alone.
    pub fn remove_candidate(&self, device_id: &DeviceId) {
        lock(&self.inner.discovered).remove(device_id);
    }

    /// Set this device's presence state and share it with connected peers.
    pub fn set_awareness(&self, state: Value) {
        let json = state.to_string();
        *lock(&self.inner.awareness) = Some(json.clone());
        for entry in self.inner.peers.iter() {
            if let (true, Some(tx)) = (entry.link.is_connected(), entry.commands.as_ref()) {
                let _ = tx.send(LinkCommand::Awareness(json.clone()));
            }
        }
    }

    /// This device's presence state.
    pub fn get_awareness(&self) -> Option<Value> {
        lock(&self.inner.awareness)
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// Presence state of connected peers.
    pub fn get_peer_awareness(&self) -> HashMap<DeviceId, Value> {
        self.inner
            .remote_awareness
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Receive coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn session(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    fn is_active(&self) -> bool {
        lock(&self.lifecycle).is_active()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn awareness_json(&self) -> String {
        lock(&self.awareness)
            .clone()
            .unwrap_or_else(|| Value::Null.to_string())
    }

    fn fail_start(self: &Arc<Self>, error: String) {
        warn!(%error, "sync start failed");
        *lock(&self.last_error) = Some(error);
        {
            let mut state = lock(&self.lifecycle);
            if let Ok(next) = state.stop() {
                *state = next;
            }
        }
        self.teardown();
        self.publish_status();
    }

    fn teardown(self: &Arc<Self>) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let peers: Vec<DeviceId> = self.peers.iter().map(|e| *e.key()).collect();
        for peer in &peers {
            if let Some(actions) = self.step(*peer, None, LinkEvent::CloseRequested) {
                self.run_actions(*peer, actions);
            }
        }
        for peer in peers {
            if let Some((_, entry)) = self.peers.remove(&peer) {
                if let Some(retry) = entry.retry {
                    retry.abort();
                }
            }
        }
        self.remote_awareness.clear();
        *lock(&self.local_port) = None;
    }

    fn current_status(&self) -> SyncStatus {
        let state = *lock(&self.lifecycle);
        let mut connected = 0;
        let mut reconnecting = false;
        for entry in self.peers.iter() {
            match entry.link {
                PeerLinkState::Connected => connected += 1,
                PeerLinkState::Reconnecting { .. } => reconnecting = true,
                _ => {}
            }
        }
        let status = if !state.is_active() {
            SyncState::Offline
        } else if connected > 0 && reconnecting {
            SyncState::Degraded
        } else if connected > 0 {
            SyncState::Connected
        } else {
            SyncState::Connecting
        };
        SyncStatus {
            status,
            peer_count: connected,
            last_sync_at: *lock(&self.last_sync_at),
            error: lock(&self.last_error).clone(),
        }
    }

    fn publish_status(self: &Arc<Self>) {
        let status = self.current_status();
        {
            let mut state = lock(&self.lifecycle);
            *state = state.with_peer_count(status.peer_count);
        }
        let (emit, deadline) = {
            let mut throttle = lock(&self.throttle);
            let emit = throttle.offer(status, Instant::now());
            (emit, throttle.next_deadline())
        };
        if let Some(status) = emit {
            self.emit(SyncEvent::StatusChanged(status));
        }
        if let Some(deadline) = deadline {
            self.schedule_status_flush(deadline);
        }
    }

    fn schedule_status_flush(self: &Arc<Self>, deadline: Instant) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            inner.flush_status();
        });
    }

    fn flush_status(self: &Arc<Self>) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let (emit, next) = {
            let mut throttle = lock(&self.throttle);
            let emit = throttle.poll(Instant::now());
            (emit, throttle.next_deadline())
        };
        if let Some(status) = emit {
            self.emit(SyncEvent::StatusChanged(status));
        }
        if let Some(deadline) = next {
            self.schedule_status_flush(deadline);
        }
    }

    /// Feed one event into a peer's state machine.
    ///
    /// With `generation` set, events from a superseded link are ignored.
    fn step(
        &self,
        peer: DeviceId,
        generation: Option<u64>,
        event: LinkEvent,
    ) -> Option<Vec<LinkAction>> {
        let mut entry = self.peers.get_mut(&peer)?;
        if generation.is_some_and(|g| g != entry.generation) {
            return None;
        }
        let (next, actions) =
            std::mem::take(&mut entry.link).on_event(event, &self.config.reconnect);
        entry.info.status = peer_status(&next);
        entry.link = next;
        Some(actions)
    }

    /// Perform the actions that need no transport; return the rest.
    fn run_actions(self: &Arc<Self>, peer: DeviceId, actions: Vec<LinkAction>) -> Vec<LinkAction> {
        let bye = actions.contains(&LinkAction::SendBye);
        let mut deferred = Vec::new();
        let mut status_changed = false;
        for action in actions {
            match action {
                LinkAction::Dial => self.spawn_dial(peer),
                LinkAction::SendHello | LinkAction::SendMissing => deferred.push(action),
                LinkAction::SendBye => {}
                LinkAction::Close => self.close_link(peer, bye),
                LinkAction::StartRetryTimer { delay } => self.schedule_retry(peer, delay),
                LinkAction::CancelRetry => {
                    if let Some(mut entry) = self.peers.get_mut(&peer) {
                        if let Some(retry) = entry.retry.take() {
                            retry.abort();
                        }
                    }
                }
                LinkAction::Evict => {
                    if let Some((_, entry)) = self.peers.remove(&peer) {
                        if let Some(retry) = entry.retry {
                            retry.abort();
                        }
                    }
                    self.remote_awareness.remove(&peer);
                    debug!(%peer, "peer evicted");
                    status_changed = true;
                }
                LinkAction::Emit(notice) => {
                    self.notify(peer, notice);
                    status_changed = true;
                }
            }
        }
        if status_changed {
            self.publish_status();
        }
        deferred
    }

    fn notify(&self, peer: DeviceId, notice: LinkNotice) {
        match notice {
            LinkNotice::Connected => {
                let info = self.peers.get(&peer).map(|e| e.info.clone());
                if let Some(info) = info {
                    info!(%peer, name = %info.device_name, "peer connected");
                    self.emit(SyncEvent::PeerConnected(info));
                }
            }
            LinkNotice::Disconnected { reason } => {
                info!(%peer, %reason, "peer disconnected");
                if self.remote_awareness.remove(&peer).is_some() {
                    self.emit(SyncEvent::AwarenessChanged {
                        device_id: peer,
                        state: None,
                    });
                }
                self.emit(SyncEvent::PeerDisconnected {
                    device_id: peer,
                    reason,
                });
            }
            LinkNotice::RetryScheduled { attempt, error } => {
                debug!(%peer, attempt, %error, "reconnect scheduled");
            }
            LinkNotice::GaveUp { attempts, error } => {
                warn!(%peer, attempts, %error, "giving up on peer");
            }
        }
    }

    fn connect_candidate(self: &Arc<Self>, candidate: &DiscoveredPeer) {
        let id = candidate.device_id;
        {
            let generation = self.next_generation();
            let mut entry = self
                .peers
                .entry(id)
                .or_insert_with(|| PeerEntry::new(id, candidate.name.clone(), generation));
            entry.candidate = Some(candidate.clone());
            if entry.link == PeerLinkState::Closed {
                entry.link = PeerLinkState::Discovered;
            }
        }
        if let Some(actions) = self.step(id, None, LinkEvent::DialRequested) {
            self.run_actions(id, actions);
        }
    }

    fn spawn_dial(self: &Arc<Self>, peer: DeviceId) {
        let known = self
            .peers
            .get(&peer)
            .and_then(|e| e.candidate.as_ref().map(|c| (c.host.clone(), c.port)));
        let address = known.or_else(|| {
            lock(&self.discovered)
                .get(&peer)
                .map(|c| (c.host.clone(), c.port))
        });
        let Some((host, port)) = address else {
            let error = "no known address".to_string();
            if let Some(actions) = self.step(peer, None, LinkEvent::DialFailed { error }) {
                self.run_actions(peer, actions);
            }
            return;
        };

        let generation = self.next_generation();
        if let Some(mut entry) = self.peers.get_mut(&peer) {
            entry.generation = generation;
            entry.outbound = true;
            entry.commands = None;
            let task = tokio::spawn(drive_outbound(Arc::clone(self), peer, generation, host, port));
            if let Some(old) = entry.task.replace(task) {
                old.abort();
            }
        }
    }

    fn close_link(&self, peer: DeviceId, bye: bool) {
        let (commands, task) = match self.peers.get_mut(&peer) {
            Some(mut entry) => (entry.commands.take(), entry.task.take()),
            None => return,
        };
        match (bye, commands) {
            (true, Some(tx)) if tx.send(LinkCommand::Close).is_ok() => {}
            _ => {
                if let Some(task) = task {
                    task.abort();
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, peer: DeviceId, delay: Duration) {
        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.is_active() {
                return;
            }
            if let Some(actions) = inner.step(peer, None, LinkEvent::RetryTimer) {
                inner.run_actions(peer, actions);
            }
        });
        match self.peers.get_mut(&peer) {
            Some(mut entry) => {
                if let Some(old) = entry.retry.replace(timer) {
                    old.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Register an inbound link. Returns its generation, or `None` when our
    /// own outbound link to the same peer takes precedence.
    fn adopt_inbound(&self, session: &Session, hello: &Hello) -> Option<u64> {
        let generation = self.next_generation();
        let candidate = lock(&self.discovered).get(&hello.device_id).cloned();
        let mut entry = self
            .peers
            .entry(hello.device_id)
            .or_insert_with(|| {
                PeerEntry::new(hello.device_id, hello.device_name.clone(), generation)
            });

        // Simultaneous dials: the link opened by the lower device id wins.
        let live = matches!(
            entry.link,
            PeerLinkState::Connecting | PeerLinkState::Handshaking | PeerLinkState::Connected
        );
        if live && entry.outbound && session.device_id.as_bytes() < hello.device_id.as_bytes() {
            return None;
        }
        if entry.generation != generation {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            entry.commands = None;
            if !matches!(entry.link, PeerLinkState::Reconnecting { .. }) {
                entry.link = PeerLinkState::Discovered;
            }
        }
        if entry.candidate.is_none() {
            entry.candidate = candidate;
        }
        entry.info.device_name = hello.device_name.clone();
        entry.outbound = false;
        entry.generation = generation;
        Some(generation)
    }

    fn touch(&self, peer: DeviceId) {
        if let Some(mut entry) = self.peers.get_mut(&peer) {
            entry.last_heard = Instant::now();
            entry.info.last_seen = now_millis();
        }
    }

    fn mark_synced(self: &Arc<Self>, peer: DeviceId) {
        let now = now_millis();
        if let Some(mut entry) = self.peers.get_mut(&peer) {
            entry.info.last_sync_at = Some(now);
        }
        *lock(&self.last_sync_at) = Some(now);
        self.publish_status();
    }

    fn on_awareness(&self, peer: DeviceId, state: &str) {
        let value: Value = match serde_json::from_str(state) {
            Ok(value) => value,
            Err(e) => {
                debug!(%peer, error = %e, "ignoring malformed awareness");
                return;
            }
        };
        let changed = if value.is_null() {
            self.remote_awareness.remove(&peer).is_some()
        } else {
            self.remote_awareness.insert(peer, value.clone()).as_ref() != Some(&value)
        };
        if changed {
            self.emit(SyncEvent::AwarenessChanged {
                device_id: peer,
                state: (!value.is_null()).then_some(value),
            });
        }
    }

    fn route_update(&self, update: &DocumentUpdate) {
        let skip = match update.origin {
            UpdateOrigin::Peer(id) => Some(id),
            UpdateOrigin::Local => None,
        };
        for entry in self.peers.iter() {
            if Some(*entry.key()) == skip || !entry.link.is_connected() {
                continue;
            }
            if let Some(tx) = entry.commands.as_ref() {
                let _ = tx.send(LinkCommand::Update(update.update.clone()));
            }
        }
    }

    fn resync_all(&self) {
        for entry in self.peers.iter() {
            if let (true, Some(tx)) = (entry.link.is_connected(), entry.commands.as_ref()) {
                let _ = tx.send(LinkCommand::Resync);
            }
        }
    }
}

async fn send(transport: &dyn Transport, message: &PeerMessage) -> Result<(), String> {
    let bytes = message.to_bytes().map_err(|e| e.to_string())?;
    if bytes.len() <= MAX_MESSAGE_SIZE {
        return transport.send(&bytes).await.map_err(|e| e.to_string());
    }
    let pieces = split_message(&bytes, CHUNK_SIZE);
    debug!(
        kind = message.kind(),
        bytes = bytes.len(),
        pieces = pieces.len(),
        "sending in chunks"
    );
    for piece in &pieces {
        let frame = piece.to_bytes().map_err(|e| e.to_string())?;
        transport.send(&frame).await.map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn await_hello(transport: &dyn Transport, timeout: Duration) -> Result<Hello, String> {
    let bytes = tokio::time::timeout(timeout, transport.recv())
        .await
        .map_err(|_| "hello timeout".to_string())?
        .map_err(|e| e.to_string())?;
    match PeerMessage::from_bytes(&bytes) {
        Ok(PeerMessage::Hello(hello)) => Ok(hello),
        Ok(other) => Err(format!("expected hello, got {}", other.kind())),
        Err(e) => Err(e.to_string()),
    }
}

fn check_hello(session: &Session, hello: &Hello, expected: Option<DeviceId>) -> Result<(), String> {
    if hello.version != PROTOCOL_VERSION {
        return Err(format!("unsupported protocol version {}", hello.version));
    }
    if hello.family_id != session.family_id {
        return Err("peer belongs to another family".into());
    }
    if hello.device_id == session.device_id {
        return Err("refusing link to self".into());
    }
    if expected.is_some_and(|id| id != hello.device_id) {
        let expected = expected.map(|d| d.to_string()).unwrap_or_default();
        return Err(format!("expected {expected}, reached {}", hello.device_id));
    }
    Ok(())
}

/// Let the remote device in, redeeming its invitation token if it brought one.
fn admit(inner: &Inner, session: &Session, hello: &Hello) -> Result<Admission, String> {
    let _guard = lock(&inner.admission);
    let admission = admit_peer(
        &session.manager,
        hello.device_id,
        &hello.device_name,
        hello.sync_token.as_deref(),
    )
    .map_err(|e| e.to_string())?;
    if let Admission::Redeemed(role) = admission {
        info!(peer = %hello.device_id, %role, "admitted new family device");
    }
    Ok(admission)
}

async fn accept_loop(inner: Arc<Inner>, mut listener: Box<dyn Listener>) {
    loop {
        match listener.accept().await {
            Ok(transport) => {
                tokio::spawn(drive_inbound(Arc::clone(&inner), transport));
            }
            Err(e) => {
                warn!(error = %e, "listener stopped");
                break;
            }
        }
    }
}

async fn drive_inbound(inner: Arc<Inner>, transport: Arc<dyn Transport>) {
    let Some(session) = inner.session() else {
        transport.close().await.ok();
        return;
    };
    let hello = match await_hello(transport.as_ref(), inner.config.hello_timeout).await {
        Ok(hello) => hello,
        Err(reason) => {
            debug!(%reason, "inbound link dropped before hello");
            transport.close().await.ok();
            return;
        }
    };
    if let Err(reason) = check_hello(&session, &hello, None)
        .and_then(|()| admit(&inner, &session, &hello).map(|_| ()))
    {
        warn!(peer = %hello.device_id, %reason, "rejecting inbound link");
        send(transport.as_ref(), &PeerMessage::Bye { reason: Some(reason) }).await.ok();
        transport.close().await.ok();
        return;
    }
    if !inner.is_active() {
        transport.close().await.ok();
        return;
    }

    let peer = hello.device_id;
    let Some(generation) = inner.adopt_inbound(&session, &hello) else {
        debug!(%peer, "keeping own link to peer");
        transport.close().await.ok();
        return;
    };
    let Some(actions) = inner.step(peer, Some(generation), LinkEvent::Accepted) else {
        transport.close().await.ok();
        return;
    };
    let pending = inner.run_actions(peer, actions);
    let established = establish(
        &inner,
        session,
        peer,
        generation,
        transport.clone(),
        pending,
        Some(hello),
    )
    .await;
    if let Err(reason) = established {
        transport.close().await.ok();
        if let Some(actions) = inner.step(peer, Some(generation), LinkEvent::LinkLost { reason }) {
            inner.run_actions(peer, actions);
        }
    }
}

async fn drive_outbound(
    inner: Arc<Inner>,
    peer: DeviceId,
    generation: u64,
    host: String,
    port: u16,
) {
    let Some(session) = inner.session() else {
        return;
    };
    let transport = match inner.connector.dial(&host, port).await {
        Ok(transport) => transport,
        Err(e) => {
            debug!(%peer, %host, port, error = %e, "dial failed");
            let event = LinkEvent::DialFailed {
                error: e.to_string(),
            };
            if let Some(actions) = inner.step(peer, Some(generation), event) {
                inner.run_actions(peer, actions);
            }
            return;
        }
    };
    let Some(actions) = inner.step(peer, Some(generation), LinkEvent::DialSucceeded) else {
        transport.close().await.ok();
        return;
    };
    let pending = inner.run_actions(peer, actions);
    let established = establish(
        &inner,
        session,
        peer,
        generation,
        transport.clone(),
        pending,
        None,
    )
    .await;
    if let Err(reason) = established {
        transport.close().await.ok();
        if let Some(actions) = inner.step(peer, Some(generation), LinkEvent::LinkLost { reason }) {
            inner.run_actions(peer, actions);
        }
    }
}

/// Finish the handshake on a new link and hand it to its link task.
async fn establish(
    inner: &Arc<Inner>,
    session: Session,
    peer: DeviceId,
    generation: u64,
    transport: Arc<dyn Transport>,
    pending: Vec<LinkAction>,
    remote: Option<Hello>,
) -> Result<(), String> {
    if pending.contains(&LinkAction::SendHello) {
        let token = lock(&inner.join_token).clone();
        let hello = session.hello(token).map_err(|e| e.to_string())?;
        send(transport.as_ref(), &hello).await?;
    }
    let outbound = remote.is_none();
    let remote = match remote {
        Some(hello) => hello,
        None => await_hello(transport.as_ref(), inner.config.hello_timeout).await?,
    };
    check_hello(&session, &remote, Some(peer))?;
    // Inbound links were admitted before they were adopted.
    if outbound {
        if let Err(reason) = admit(inner, &session, &remote) {
            warn!(%peer, %reason, "refusing peer");
            let bye = PeerMessage::Bye {
                reason: Some(reason.clone()),
            };
            send(transport.as_ref(), &bye).await.ok();
            return Err(reason);
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    {
        let Some(mut entry) = inner.peers.get_mut(&peer) else {
            return Err("peer evicted".into());
        };
        if entry.generation != generation {
            return Err("link superseded".into());
        }
        entry.commands = Some(tx);
        entry.info.device_name = remote.device_name.clone();
        entry.last_heard = Instant::now();
    }
    let actions = inner
        .step(peer, Some(generation), LinkEvent::HelloReceived)
        .ok_or_else(|| "link superseded".to_string())?;
    let deferred = inner.run_actions(peer, actions);
    if !deferred.contains(&LinkAction::SendMissing) {
        return Err("handshake out of order".into());
    }
    let update = session
        .manager
        .get_update(Some(&remote.state_vector))
        .map_err(|e| e.to_string())?;
    send(transport.as_ref(), &PeerMessage::SyncStep2 { update }).await?;

    let link = LinkIo {
        inner: Arc::clone(inner),
        session,
        peer,
        transport: transport.clone(),
        remote_sv: remote.state_vector,
        buffer: UpdateBuffer::new(inner.config.buffer_capacity),
        chunks: Reassembler::default(),
    };
    let task = tokio::spawn(run_link(link, generation, rx));
    match inner.peers.get_mut(&peer) {
        Some(mut entry) if entry.generation == generation => {
            // Replaces the dial task that got us here; it is about to finish.
            entry.task = Some(task);
        }
        _ => task.abort(),
    }
    Ok(())
}

async fn read_loop(
    transport: Arc<dyn Transport>,
    incoming: mpsc::Sender<Result<Vec<u8>, TransportError>>,
) {
    loop {
        let result = transport.recv().await;
        let failed = result.is_err();
        if incoming.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// State of one established link.
struct LinkIo {
    inner: Arc<Inner>,
    session: Session,
    peer: DeviceId,
    transport: Arc<dyn Transport>,
    remote_sv: Vec<u8>,
    buffer: UpdateBuffer,
    chunks: Reassembler,
}

async fn run_link(
    mut link: LinkIo,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let (incoming_tx, mut incoming) = mpsc::channel(64);
    let _reader = AbortOnDrop(tokio::spawn(read_loop(link.transport.clone(), incoming_tx)));
    let period = link
        .inner
        .config
        .keepalive_interval
        .max(Duration::from_millis(10));
    let mut keepalive = tokio::time::interval(period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        let step = tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Close) | None => {
                    link.close("closed").await;
                    return;
                }
                Some(command) => link.on_command(command).await,
            },
            message = incoming.recv() => match message {
                Some(Ok(bytes)) => link.on_message(&bytes).await,
                Some(Err(e)) => Err(e.to_string()),
                None => Err("reader stopped".to_string()),
            },
            _ = keepalive.tick() => {
                let state = link.inner.awareness_json();
                let device_id = link.session.device_id;
                link.send(&PeerMessage::Awareness { device_id, state }).await
            }
        };
        if let Err(reason) = step {
            break reason;
        }
    };

    link.transport.close().await.ok();
    let peer = link.peer;
    debug!(%peer, %reason, "link lost");
    if let Some(actions) = link.inner.step(peer, Some(generation), LinkEvent::LinkLost { reason }) {
        link.inner.run_actions(peer, actions);
    }
}

impl LinkIo {
    async fn send(&self, message: &PeerMessage) -> Result<(), String> {
        send(self.transport.as_ref(), message).await
    }

    async fn close(&self, reason: &str) {
        self.send(&PeerMessage::Bye {
            reason: Some(reason.to_string()),
        })
        .await
        .ok();
        self.transport.close().await.ok();
    }

    async fn on_command(&mut self, command: LinkCommand) -> Result<(), String> {
        match command {
            LinkCommand::Update(update) => match self.buffer.enqueue(update.clone()) {
                Ok(seq) => self.send(&PeerMessage::Update { seq, update }).await,
                Err(BufferError::Full { capacity }) => {
                    warn!(peer = %self.peer, capacity, "peer not acknowledging, resyncing");
                    self.buffer.clear();
                    self.resync().await
                }
            },
            LinkCommand::Resync => self.resync().await,
            LinkCommand::Awareness(state) => {
                self.send(&PeerMessage::Awareness {
                    device_id: self.session.device_id,
                    state,
                })
                .await
            }
            LinkCommand::Close => Ok(()),
        }
    }

    /// Send everything the peer lacks per its last known state vector, and ask
    /// for everything we lack.
    async fn resync(&mut self) -> Result<(), String> {
        let manager = &self.session.manager;
        let update = manager
            .get_update(Some(&self.remote_sv))
            .map_err(|e| e.to_string())?;
        let state_vector = manager.get_state_vector().map_err(|e| e.to_string())?;
        self.send(&PeerMessage::SyncStep2 { update }).await?;
        self.send(&PeerMessage::SyncStep1 { state_vector }).await
    }

    async fn on_message(&mut self, bytes: &[u8]) -> Result<(), String> {
        let message = match PeerMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "dropping undecodable message");
                return Ok(());
            }
        };
        self.inner.touch(self.peer);
        let message = match message {
            PeerMessage::Chunk { index, total, data } => {
                match self.reassemble(index, total, &data) {
                    Some(message) => message,
                    None => return Ok(()),
                }
            }
            message => message,
        };
        debug!(peer = %self.peer, kind = message.kind(), "message");

        match message {
            PeerMessage::Hello(_) | PeerMessage::Chunk { .. } => Ok(()),
            PeerMessage::SyncStep1 { state_vector } => {
                match self.session.manager.get_update(Some(&state_vector)) {
                    Ok(update) => self.send(&PeerMessage::SyncStep2 { update }).await,
                    Err(DocumentError::InvalidStateVector(e)) => {
                        warn!(peer = %self.peer, error = %e, "ignoring bad state vector");
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            PeerMessage::SyncStep2 { update } => self.apply(0, &update).await,
            PeerMessage::Update { seq, update } => self.apply(seq, &update).await,
            PeerMessage::Ack { seq, state_vector } => {
                let pruned = self.buffer.ack_through(seq);
                self.remote_sv = state_vector;
                debug!(peer = %self.peer, seq, pruned, "ack");
                self.inner.mark_synced(self.peer);
                Ok(())
            }
            PeerMessage::Awareness { state, .. } => {
                self.inner.on_awareness(self.peer, &state);
                Ok(())
            }
            PeerMessage::Bye { reason } => Err(format!(
                "peer left: {}",
                reason.unwrap_or_else(|| "no reason".into())
            )),
        }
    }

    /// Feed one piece to the reassembler. Returns the message once complete.
    fn reassemble(&mut self, index: u32, total: u32, data: &[u8]) -> Option<PeerMessage> {
        let bytes = match self.chunks.push(index, total, data) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "dropping chunked message");
                return None;
            }
        };
        match PeerMessage::from_bytes(&bytes) {
            Ok(PeerMessage::Chunk { .. }) => {
                warn!(peer = %self.peer, "dropping nested chunk");
                None
            }
            Ok(message) => Some(message),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "dropping undecodable chunked message");
                None
            }
        }
    }

    async fn apply(&mut self, seq: u64, update: &[u8]) -> Result<(), String> {
        let manager = &self.session.manager;
        match manager.apply_remote_update(update, UpdateOrigin::Peer(self.peer)) {
            Ok(changed) => {
                debug!(peer = %self.peer, seq, changed, "applied remote update");
                let state_vector = manager.get_state_vector().map_err(|e| e.to_string())?;
                self.send(&PeerMessage::Ack { seq, state_vector }).await
            }
            Err(DocumentError::InvalidUpdate(e)) => {
                warn!(peer = %self.peer, seq, error = %e, "rejected invalid update");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

async fn forward_updates(inner: Arc<Inner>, mut updates: broadcast::Receiver<DocumentUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => inner.route_update(&update),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "update stream lagged, resyncing peers");
                inner.resync_all();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn sweep_silent(inner: Arc<Inner>) {
    let timeout = inner.config.peer_timeout;
    let mut tick = tokio::time::interval((timeout / 2).max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let silent: Vec<DeviceId> = inner
            .peers
            .iter()
            .filter(|e| e.link.is_connected() && e.last_heard.elapsed() > timeout)
            .map(|e| *e.key())
            .collect();
        for peer in silent {
            warn!(%peer, ?timeout, "peer silent, evicting");
            if let Some(actions) = inner.step(peer, None, LinkEvent::Silent) {
                inner.run_actions(peer, actions);
            }
        }
    }
}
