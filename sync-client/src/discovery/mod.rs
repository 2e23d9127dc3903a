//! Local-network discovery and the join handshake.
//!
//! Every device announces itself with a [`Beacon`] at a fixed interval. An
//! admin additionally publishes its family so that new devices can find it and
//! ask to join. Discovered families and devices live in TTL maps and drop out
//! when their announcements stop.
//!
//! Join requests and admin replies travel as beacons addressed to one device:
//!
//! ```text
//! Requester                               Admin
//!    |  send_join_request(family) ──────►   |  JoinRequestReceived
//!    |                                      |  approve_join_request(..)
//!    |  JoinApprovalReceived ◄────────────  |  send_join_approval(..)
//! ```
//!
//! Beacons are plain JSON on the local network.

mod memory;
mod udp;

pub use memory::{MemoryAdvertiser, MemoryLan};
pub use udp::UdpAdvertiser;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use sync_core::{ExpiringMap, JoinError, JoinRegistry, DEFAULT_DISCOVERY_TTL};
use sync_types::{
    now_millis, Beacon, DeviceId, DiscoveredFamily, DiscoveredPeer, FamilyAdvert, FamilyId,
    JoinApproval, JoinRequest, RequestId, Role, SyncError,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default lifetime of join bookkeeping.
pub const DEFAULT_JOIN_TTL: Duration = Duration::from_secs(600);

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// `initialize_basic` has not been called.
    #[error("discovery not initialized")]
    NotInitialized,

    /// No advertisement for this family has been seen.
    #[error("unknown family: {0}")]
    UnknownFamily(FamilyId),

    /// The join request is not pending or was never answered here.
    #[error("unknown join request: {0}")]
    UnknownRequest(RequestId),

    /// Beacon encoding failed.
    #[error("beacon error: {0}")]
    Beacon(#[from] SyncError),

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A beacon together with the host it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedBeacon {
    /// Decoded beacon.
    pub beacon: Beacon,
    /// Sender address, usable for dialing.
    pub host: String,
}

/// Local-network broadcast substrate.
///
/// Delivery is best effort: beacons may be lost or arrive more than once.
#[async_trait]
pub trait Advertiser: Send + Sync {
    /// Broadcast one beacon.
    async fn publish(&self, beacon: &Beacon) -> Result<(), DiscoveryError>;

    /// Receive beacons from the network, including our own.
    fn subscribe(&self) -> broadcast::Receiver<ObservedBeacon>;
}

/// A device seen on the local network.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    /// Where to reach the device.
    pub peer: DiscoveredPeer,
    /// Family the device syncs, if any.
    pub member_of: Option<FamilyId>,
}

/// Events pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A family advertisement appeared.
    FamilyDiscovered(DiscoveredFamily),
    /// A family advertisement expired or was withdrawn.
    FamilyLost(FamilyId),
    /// A device announcement appeared or its address changed.
    DeviceDiscovered(DiscoveredDevice),
    /// A device announcement expired or was withdrawn.
    DeviceLost(DeviceId),
    /// A device asked to join (admin side).
    JoinRequestReceived(JoinRequest),
    /// A pending request was approved (admin side).
    JoinRequestApproved(JoinRequest),
    /// A pending request was rejected (admin side).
    JoinRequestRejected(JoinRequest),
    /// An admin answered one of our requests (requester side).
    JoinApprovalReceived(JoinApproval),
}

/// Discovery timing.
#[derive(Debug, Clone)]
pub struct DiscoveryTiming {
    /// Interval between announcements.
    pub announce_interval: Duration,
    /// Lifetime of an entry without refresh.
    pub ttl: Duration,
    /// Lifetime of join bookkeeping: answered requests, our own requests and
    /// received replies.
    pub join_ttl: Duration,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5),
            ttl: DEFAULT_DISCOVERY_TTL,
            join_ttl: DEFAULT_JOIN_TTL,
        }
    }
}

impl From<&DiscoveryConfig> for DiscoveryTiming {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            announce_interval: Duration::from_secs(config.announce_interval_secs),
            ttl: Duration::from_secs(config.ttl_secs),
            join_ttl: Duration::from_secs(config.join_ttl_secs),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalDevice {
    device_id: DeviceId,
    device_name: String,
    link_port: u16,
    member_of: Option<FamilyId>,
    published: Option<FamilyAdvert>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record `value` for a join request, dropping stale entries first.
fn remember<V: Clone>(map: &Mutex<ExpiringMap<RequestId, V>>, id: RequestId, value: V) {
    let now = Instant::now();
    let mut map = lock(map);
    map.expire(now);
    map.observe(id, value, now, |_, new| new);
}

struct Inner {
    advertiser: Arc<dyn Advertiser>,
    timing: DiscoveryTiming,
    local: Mutex<Option<LocalDevice>>,
    discovering: AtomicBool,
    families: Mutex<ExpiringMap<FamilyId, DiscoveredFamily>>,
    devices: Mutex<ExpiringMap<DeviceId, DiscoveredDevice>>,
    joins: Mutex<JoinRegistry>,
    // Resolved requests we still have to answer, by requester.
    answered: Mutex<ExpiringMap<RequestId, DeviceId>>,
    // Our own requests awaiting a reply, by the admin they were sent to.
    sent: Mutex<ExpiringMap<RequestId, DeviceId>>,
    approvals: Mutex<ExpiringMap<RequestId, JoinApproval>>,
    events: broadcast::Sender<DiscoveryEvent>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

/// Advertises this device, discovers others and brokers join requests.
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl DiscoveryService {
    /// Create a service on top of an advertisement substrate.
    pub fn new(advertiser: Arc<dyn Advertiser>, timing: DiscoveryTiming) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                advertiser,
                families: Mutex::new(ExpiringMap::new(timing.ttl)),
                devices: Mutex::new(ExpiringMap::new(timing.ttl)),
                local: Mutex::new(None),
                discovering: AtomicBool::new(false),
                joins: Mutex::new(JoinRegistry::new()),
                answered: Mutex::new(ExpiringMap::new(timing.join_ttl)),
                sent: Mutex::new(ExpiringMap::new(timing.join_ttl)),
                approvals: Mutex::new(ExpiringMap::new(timing.join_ttl)),
                timing,
                events,
                announce_task: Mutex::new(None),
                listen_task: Mutex::new(None),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    /// Make this device visible and reachable for join replies.
    ///
    /// Works before the device belongs to any family. Calling it again only
    /// updates the name.
    pub fn initialize_basic(&self, device_id: DeviceId, device_name: impl Into<String>) {
        let device_name = device_name.into();
        {
            let mut local = lock(&self.inner.local);
            match local.as_mut() {
                Some(existing) if existing.device_id == device_id => {
                    existing.device_name = device_name;
                    return;
                }
                _ => {
                    *local = Some(LocalDevice {
                        device_id,
                        device_name,
                        link_port: 0,
                        member_of: None,
                        published: None,
                    });
                }
            }
        }
        let beacons = self.inner.advertiser.subscribe();
        let listener = tokio::spawn(listen_loop(Arc::clone(&self.inner), beacons));
        if let Some(old) = lock(&self.inner.listen_task).replace(listener) {
            old.abort();
        }
        self.inner.restart_announcing();
        info!(%device_id, "discovery initialized");
    }

    /// Whether `initialize_basic` has run.
    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.local).is_some()
    }

    /// Advertise the port peers dial to reach this device (0 = not reachable).
    pub fn set_link_port(&self, port: u16) {
        if self.inner.update_local(|local| local.link_port = port) {
            self.inner.restart_announcing();
        }
    }

    /// Advertise which family this device syncs.
    pub fn set_member_family(&self, family_id: Option<FamilyId>) {
        if self.inner.update_local(|local| local.member_of = family_id) {
            self.inner.restart_announcing();
        }
    }

    /// Family this device announces as syncing.
    pub fn member_family(&self) -> Option<FamilyId> {
        lock(&self.inner.local).as_ref().and_then(|l| l.member_of)
    }

    /// Publish `family_id` so new devices can find it and ask to join.
    pub fn start_publishing(
        &self,
        family_id: FamilyId,
        family_name: &str,
    ) -> Result<(), DiscoveryError> {
        let advert = FamilyAdvert {
            family_id,
            name: family_name.to_string(),
        };
        let updated = self.inner.update_local(|local| {
            local.published = Some(advert);
            local.member_of = Some(family_id);
        });
        if !updated {
            return Err(DiscoveryError::NotInitialized);
        }
        self.inner.restart_announcing();
        info!(%family_id, name = family_name, "publishing family");
        Ok(())
    }

    /// [`start_publishing`](Self::start_publishing) for a device confirmed
    /// as the family's admin at startup.
    pub fn start_family_publishing(
        &self,
        family_id: FamilyId,
        family_name: &str,
    ) -> Result<(), DiscoveryError> {
        debug!(%family_id, "admin confirmed, publishing at startup");
        self.start_publishing(family_id, family_name)
    }

    /// Stop publishing the family. The device keeps announcing itself.
    pub fn stop_publishing(&self) {
        if self.inner.update_local(|local| local.published = None) {
            self.inner.restart_announcing();
            info!("stopped publishing family");
        }
    }

    /// Whether a family is being published.
    pub fn is_publishing(&self) -> bool {
        lock(&self.inner.local)
            .as_ref()
            .is_some_and(|l| l.published.is_some())
    }

    /// Start collecting advertisements from other devices.
    pub fn start_discovering(&self) -> Result<(), DiscoveryError> {
        if !self.is_initialized() {
            return Err(DiscoveryError::NotInitialized);
        }
        if self.inner.discovering.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sweep = tokio::spawn(sweep_expired(Arc::clone(&self.inner)));
        if let Some(old) = lock(&self.inner.sweep_task).replace(sweep) {
            old.abort();
        }
        info!("discovering");
        Ok(())
    }

    /// Stop collecting advertisements and forget what was found.
    pub fn stop_discovering(&self) {
        if !self.inner.discovering.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(sweep) = lock(&self.inner.sweep_task).take() {
            sweep.abort();
        }
        lock(&self.inner.families).clear();
        lock(&self.inner.devices).clear();
        info!("stopped discovering");
    }

    /// Whether advertisements are being collected.
    pub fn is_discovering(&self) -> bool {
        self.inner.discovering.load(Ordering::SeqCst)
    }

    /// Families currently advertised on the network.
    pub fn get_discovered_families(&self) -> Vec<DiscoveredFamily> {
        let mut families = lock(&self.inner.families).values();
        families.sort_by_key(|f| f.discovered_at);
        families
    }

    /// Devices currently announcing themselves.
    pub fn get_discovered_devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices = lock(&self.inner.devices).values();
        devices.sort_by_key(|d| d.peer.discovered_at);
        devices
    }

    /// Reachable devices that sync `family_id`.
    pub fn family_peers(&self, family_id: FamilyId) -> Vec<DiscoveredPeer> {
        self.get_discovered_devices()
            .into_iter()
            .filter(|d| d.member_of == Some(family_id) && d.peer.port != 0)
            .map(|d| d.peer)
            .collect()
    }

    /// Build a request to join `family_id`. Nothing is sent.
    pub fn create_join_request(&self, family_id: FamilyId) -> Result<JoinRequest, DiscoveryError> {
        let local = lock(&self.inner.local)
            .clone()
            .ok_or(DiscoveryError::NotInitialized)?;
        Ok(JoinRequest {
            id: RequestId::new(),
            device_id: local.device_id,
            device_name: local.device_name,
            family_id: Some(family_id),
            requested_at: now_millis(),
        })
    }

    /// Create a join request and send it to the family's publishing admin.
    pub async fn send_join_request(
        &self,
        family_id: FamilyId,
    ) -> Result<JoinRequest, DiscoveryError> {
        let admin = lock(&self.inner.families)
            .get(&family_id)
            .map(|f| f.admin_device_id)
            .ok_or(DiscoveryError::UnknownFamily(family_id))?;
        let request = self.create_join_request(family_id)?;
        remember(&self.inner.sent, request.id, admin);
        self.inner
            .advertiser
            .publish(&Beacon::JoinRequest {
                to: admin,
                request: request.clone(),
            })
            .await?;
        info!(request_id = %request.id, %family_id, %admin, "join request sent");
        Ok(request)
    }

    /// Record a join request from `device_id` (admin side).
    ///
    /// A device with a request already pending gets that request back and no
    /// new event fires.
    pub fn receive_join_request(&self, device_id: DeviceId, device_name: &str) -> JoinRequest {
        let (request, new) =
            lock(&self.inner.joins).receive(device_id, device_name, None, now_millis());
        if new {
            self.inner.announce_request(&request);
        }
        request
    }

    /// Requests waiting for a decision, oldest first.
    pub fn get_pending_join_requests(&self) -> Vec<JoinRequest> {
        lock(&self.inner.joins).pending()
    }

    /// Approve a pending request.
    ///
    /// The returned approval carries no token yet; the caller mints one before
    /// relaying it with [`send_join_approval`](Self::send_join_approval).
    pub fn approve_join_request(
        &self,
        request_id: RequestId,
        role: Role,
        family_id: FamilyId,
        family_name: &str,
    ) -> Result<JoinApproval, DiscoveryError> {
        let request = lock(&self.inner.joins)
            .approve(request_id)
            .map_err(|JoinError::UnknownRequest(id)| DiscoveryError::UnknownRequest(id))?;
        remember(&self.inner.answered, request_id, request.device_id);
        info!(%request_id, device_id = %request.device_id, ?role, "join request approved");
        self.inner.emit(DiscoveryEvent::JoinRequestApproved(request));
        Ok(JoinApproval {
            request_id,
            approved: true,
            role,
            family_id,
            family_name: family_name.to_string(),
            sync_token: None,
        })
    }

    /// Reject a pending request. Returns `false` if it was not pending.
    pub fn reject_join_request(&self, request_id: RequestId) -> bool {
        let Some(request) = lock(&self.inner.joins).reject(request_id) else {
            debug!(%request_id, "reject ignored, request not pending");
            return false;
        };
        remember(&self.inner.answered, request_id, request.device_id);
        info!(%request_id, device_id = %request.device_id, "join request rejected");
        self.inner.emit(DiscoveryEvent::JoinRequestRejected(request));
        true
    }

    /// Device that made a resolved request not yet answered.
    pub fn requester(&self, request_id: RequestId) -> Option<DeviceId> {
        lock(&self.inner.answered).get(&request_id).copied()
    }

    /// Relay an admin decision to the requesting device.
    ///
    /// Each resolved request is answered once.
    pub async fn send_join_approval(&self, approval: &JoinApproval) -> Result<(), DiscoveryError> {
        let own = lock(&self.inner.local)
            .as_ref()
            .map(|l| l.device_id)
            .ok_or(DiscoveryError::NotInitialized)?;
        let to = lock(&self.inner.answered)
            .get(&approval.request_id)
            .copied()
            .ok_or(DiscoveryError::UnknownRequest(approval.request_id))?;
        self.inner
            .advertiser
            .publish(&Beacon::JoinReply {
                device_id: own,
                to,
                approval: approval.clone(),
            })
            .await?;
        lock(&self.inner.answered).remove(&approval.request_id);
        debug!(
            request_id = %approval.request_id,
            %to,
            approved = approval.approved,
            "join reply sent"
        );
        Ok(())
    }

    /// The admin's answer to one of our requests, once received.
    pub fn join_approval(&self, request_id: RequestId) -> Option<JoinApproval> {
        lock(&self.inner.approvals).get(&request_id).cloned()
    }

    /// Receive discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    /// Stop every task and tell the network this device is leaving.
    pub async fn shutdown(&self) {
        self.stop_discovering();
        for slot in [
            &self.inner.announce_task,
            &self.inner.listen_task,
            &self.inner.sweep_task,
        ] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
        let own = lock(&self.inner.local).as_ref().map(|l| l.device_id);
        if let Some(device_id) = own {
            if let Err(e) = self.inner.advertiser.publish(&Beacon::Withdraw { device_id }).await {
                debug!(error = %e, "withdraw beacon not sent");
            }
        }
        info!("discovery shut down");
    }
}

impl Inner {
    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event);
    }

    /// Apply `change` to the local device. Returns `false` if not initialized.
    fn update_local(&self, change: impl FnOnce(&mut LocalDevice)) -> bool {
        match lock(&self.local).as_mut() {
            Some(local) => {
                change(local);
                true
            }
            None => false,
        }
    }

    fn announcement(&self) -> Option<Beacon> {
        lock(&self.local).as_ref().map(|local| Beacon::Announce {
            device_id: local.device_id,
            device_name: local.device_name.clone(),
            port: local.link_port,
            family: local.published.clone(),
            member_of: local.member_of,
        })
    }

    /// Replace the announce timer so the next beacon goes out now.
    fn restart_announcing(self: &Arc<Self>) {
        let task = tokio::spawn(announce_loop(Arc::clone(self)));
        if let Some(old) = lock(&self.announce_task).replace(task) {
            old.abort();
        }
    }

    fn announce_request(&self, request: &JoinRequest) {
        info!(
            request_id = %request.id,
            device_id = %request.device_id,
            name = %request.device_name,
            "join request received"
        );
        self.emit(DiscoveryEvent::JoinRequestReceived(request.clone()));
    }

    fn observe(&self, observed: ObservedBeacon) {
        let Some(own) = lock(&self.local).as_ref().map(|l| l.device_id) else {
            return;
        };
        let sender = observed.beacon.device_id();
        if sender == own || observed.beacon.recipient().is_some_and(|to| to != own) {
            return;
        }

        match observed.beacon {
            Beacon::Announce {
                device_id,
                device_name,
                port,
                family,
                member_of,
            } => {
                if !self.discovering.load(Ordering::SeqCst) {
                    return;
                }
                self.observe_device(device_id, device_name, &observed.host, port, member_of);
                if let Some(advert) = family {
                    self.observe_family(device_id, advert, &observed.host, port);
                }
            }
            Beacon::Withdraw { device_id } => self.forget_device(device_id),
            Beacon::JoinRequest { request, .. } => {
                let (request, new) = lock(&self.joins).admit(request);
                if new {
                    self.announce_request(&request);
                }
            }
            Beacon::JoinReply {
                device_id,
                approval,
                ..
            } => {
                if lock(&self.approvals).get(&approval.request_id).is_some() {
                    debug!(request_id = %approval.request_id, "duplicate join reply");
                    return;
                }
                let expected = lock(&self.sent).get(&approval.request_id).copied();
                if expected != Some(device_id) {
                    warn!(
                        request_id = %approval.request_id,
                        from = %device_id,
                        "ignoring unexpected join reply"
                    );
                    return;
                }
                lock(&self.sent).remove(&approval.request_id);
                remember(&self.approvals, approval.request_id, approval.clone());
                info!(
                    request_id = %approval.request_id,
                    approved = approval.approved,
                    "join reply received"
                );
                self.emit(DiscoveryEvent::JoinApprovalReceived(approval));
            }
        }
    }

    fn observe_device(
        &self,
        device_id: DeviceId,
        name: String,
        host: &str,
        port: u16,
        member_of: Option<FamilyId>,
    ) {
        let device = DiscoveredDevice {
            peer: DiscoveredPeer {
                device_id,
                name,
                host: host.to_string(),
                port,
                discovered_at: now_millis(),
            },
            member_of,
        };
        let mut changed = false;
        let now = Instant::now();
        let new = lock(&self.devices).observe(device_id, device.clone(), now, |old, new| {
            changed = old.peer.host != new.peer.host
                || old.peer.port != new.peer.port
                || old.member_of != new.member_of;
            DiscoveredDevice {
                peer: DiscoveredPeer {
                    discovered_at: old.peer.discovered_at,
                    ..new.peer
                },
                member_of: new.member_of,
            }
        });
        if new || changed {
            debug!(%device_id, host, port, "device discovered");
            self.emit(DiscoveryEvent::DeviceDiscovered(device));
        }
    }

    fn observe_family(&self, admin: DeviceId, advert: FamilyAdvert, host: &str, port: u16) {
        let family = DiscoveredFamily {
            family_id: advert.family_id,
            name: advert.name,
            admin_device_id: admin,
            host: host.to_string(),
            port,
            discovered_at: now_millis(),
        };
        let new = lock(&self.families).observe(
            family.family_id,
            family.clone(),
            Instant::now(),
            |old, new| DiscoveredFamily {
                discovered_at: old.discovered_at,
                ..new
            },
        );
        if new {
            info!(family_id = %family.family_id, name = %family.name, "family discovered");
            self.emit(DiscoveryEvent::FamilyDiscovered(family));
        }
    }

    fn forget_device(&self, device_id: DeviceId) {
        if lock(&self.devices).remove(&device_id).is_some() {
            debug!(%device_id, "device withdrew");
            self.emit(DiscoveryEvent::DeviceLost(device_id));
        }
        let lost: Vec<FamilyId> = {
            let mut families = lock(&self.families);
            let ids: Vec<FamilyId> = families
                .values()
                .into_iter()
                .filter(|f| f.admin_device_id == device_id)
                .map(|f| f.family_id)
                .collect();
            for id in &ids {
                families.remove(id);
            }
            ids
        };
        for family_id in lost {
            self.emit(DiscoveryEvent::FamilyLost(family_id));
        }
    }

    fn expire(&self) {
        let now = Instant::now();
        let devices = lock(&self.devices).expire(now);
        let families = lock(&self.families).expire(now);
        let joins = lock(&self.answered).expire(now).len()
            + lock(&self.sent).expire(now).len()
            + lock(&self.approvals).expire(now).len();
        if joins > 0 {
            debug!(joins, "join bookkeeping expired");
        }
        for (device_id, _) in devices {
            debug!(%device_id, "device expired");
            self.emit(DiscoveryEvent::DeviceLost(device_id));
        }
        for (family_id, _) in families {
            info!(%family_id, "family expired");
            self.emit(DiscoveryEvent::FamilyLost(family_id));
        }
    }
}

async fn announce_loop(inner: Arc<Inner>) {
    let mut tick = tokio::time::interval(inner.timing.announce_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(beacon) = inner.announcement() else {
            break;
        };
        if let Err(e) = inner.advertiser.publish(&beacon).await {
            warn!(error = %e, "announcement failed");
        }
    }
}

async fn listen_loop(inner: Arc<Inner>, mut beacons: broadcast::Receiver<ObservedBeacon>) {
    loop {
        match beacons.recv().await {
            Ok(observed) => inner.observe(observed),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "beacon stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn sweep_expired(inner: Arc<Inner>) {
    let period = (inner.timing.ttl / 4).max(Duration::from_millis(10));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        inner.expire();
    }
}
