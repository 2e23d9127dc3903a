//! Family membership on top of the replicated document.
//!
//! Creating a family, registering devices, granting roles and the
//! single-use invitation tokens that let a new device join. All records live
//! in the document collections, so every change replicates to peers like any
//! other write. Issued tokens are also kept in the local key-value store under
//! `invite/<token>` so an admin can list what they handed out.
//!
//! An invitation is redeemed at the admin that issued it: the joining device
//! presents the token when it first links to the admin, and [`admit_peer`]
//! marks it used and registers the device before any document data flows.
//! The joiner then confirms with [`FamilyService::join`] once its grant has
//! synced back.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sync_core::{new_invitation, redeem, MIN_TOKEN_BYTES};
use sync_types::{
    now_millis, Device, DeviceId, Family, FamilyId, Invitation, JoinApproval, Member, Permission,
    Role, Timestamp,
};
use tracing::{info, warn};

use crate::collection::{DocumentStructure, FAMILY_KEY};
use crate::error::{DocumentError, FamilyError};
use crate::identity::{DeviceIdentity, TokenGenerator};
use crate::manager::DocumentReplicaManager;
use crate::store::{get_string, KeyValueStore};

const INVITE_PREFIX: &str = "invite/";
const JOIN_TOKEN_KEY: &str = "settings/join_token";

/// Family as seen from the current device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyState {
    /// The family record.
    pub family: Family,
    /// Registered devices, `is_current` set for this one.
    pub devices: Vec<Device>,
    /// Family members.
    pub members: Vec<Member>,
    /// Role grants.
    pub permissions: Vec<Permission>,
    /// This device.
    pub current_device_id: DeviceId,
}

impl FamilyState {
    /// Role held by `device`, if any.
    pub fn role_of(&self, device: &DeviceId) -> Option<Role> {
        self.permissions
            .iter()
            .find(|p| p.device_id == *device)
            .map(|p| p.role)
    }
}

/// Why a peer may sync the family document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// This replica holds no family yet and is waiting for a peer to bring it.
    Bootstrap,
    /// The peer already holds a role.
    Member(Role),
    /// The peer redeemed an invitation here and now holds a role.
    Redeemed(Role),
}

/// Role `device` holds in the family document, if any.
pub fn member_role(
    manager: &DocumentReplicaManager,
    device: DeviceId,
) -> Result<Option<Role>, FamilyError> {
    let doc = manager.get_structure()?;
    let grant = doc.permissions.get_as::<Permission>(&device.to_string())?;
    Ok(grant.map(|p| p.role))
}

/// Decide whether `peer` may sync the family document held by `manager`.
///
/// Members are let in. A non-member presenting `token` is let in only by an
/// admin, and only if the token is a stored, unused invitation that is not
/// bound to another device; the invitation is then consumed and the peer
/// registered with its role. Callers serialize concurrent admissions.
pub fn admit_peer(
    manager: &DocumentReplicaManager,
    peer: DeviceId,
    peer_name: &str,
    token: Option<&str>,
) -> Result<Admission, FamilyError> {
    let doc = manager.get_structure()?;
    if doc.family.get(FAMILY_KEY)?.is_none() {
        return Ok(Admission::Bootstrap);
    }
    if let Some(grant) = doc.permissions.get_as::<Permission>(&peer.to_string())? {
        return Ok(Admission::Member(grant.role));
    }
    let Some(token) = token else {
        return Err(FamilyError::NotMember(peer));
    };
    let local = manager.device_id();
    let grant = doc.permissions.get_as::<Permission>(&local.to_string())?;
    if !matches!(grant, Some(p) if p.role == Role::Admin) {
        return Err(FamilyError::NotAdmin("redeem invitations"));
    }

    let stored = doc.invitations.get_as::<Invitation>(token)?;
    let now = now_millis();
    let redeemed = redeem(stored.as_ref(), token, peer, now).map_err(|e| {
        warn!(%peer, reason = %e, "invitation refused");
        FamilyError::InvalidToken
    })?;
    doc.invitations.set_value(token, &redeemed)?;
    register(&doc, peer, peer_name, redeemed.role, now, false)?;
    info!(%peer, name = peer_name, role = %redeemed.role, "invitation redeemed");
    Ok(Admission::Redeemed(redeemed.role))
}

/// Family management for the local device.
pub struct FamilyService {
    manager: Arc<DocumentReplicaManager>,
    store: Arc<dyn KeyValueStore>,
    tokens: Arc<dyn TokenGenerator>,
    device_id: DeviceId,
    device_name: String,
}

impl FamilyService {
    /// Create a service acting as the manager's device.
    pub fn new(
        manager: Arc<DocumentReplicaManager>,
        store: Arc<dyn KeyValueStore>,
        tokens: Arc<dyn TokenGenerator>,
        device_name: impl Into<String>,
    ) -> Self {
        let device_id = manager.device_id();
        Self {
            manager,
            store,
            tokens,
            device_id,
            device_name: device_name.into(),
        }
    }

    /// Current device.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Create a family with this device as its admin.
    pub async fn create_family(&self, name: &str) -> Result<Family, FamilyError> {
        let doc = self.manager.get_structure()?;
        if doc.family.get(FAMILY_KEY)?.is_some()
            || DeviceIdentity::load_family_id(self.store.as_ref())
                .await?
                .is_some()
        {
            return Err(FamilyError::AlreadyInFamily);
        }

        let now = now_millis();
        let family = Family {
            id: FamilyId::new(),
            name: name.to_string(),
            created_at: now,
            created_by: self.device_id,
        };
        doc.family.set_value(FAMILY_KEY, &family)?;
        register(&doc, self.device_id, &self.device_name, Role::Admin, now, true)?;
        DeviceIdentity::store_family_id(self.store.as_ref(), family.id).await?;

        info!(family_id = %family.id, name, "family created");
        Ok(family)
    }

    /// The family record, once created or synced.
    pub fn family(&self) -> Result<Option<Family>, FamilyError> {
        let doc = self.manager.get_structure()?;
        Ok(doc.family.get_as(FAMILY_KEY)?)
    }

    /// Read the family state and record that this device was seen.
    pub fn get_family_state(&self) -> Result<Option<FamilyState>, FamilyError> {
        let doc = self.manager.get_structure()?;
        let Some(family) = doc.family.get_as::<Family>(FAMILY_KEY)? else {
            return Ok(None);
        };

        let key = self.device_id.to_string();
        if let Some(mut me) = doc.devices.get_as::<Device>(&key)? {
            me.last_seen = now_millis();
            doc.devices.set_value(&key, &me)?;
        }

        let mut devices: Vec<Device> = doc.devices.values_as()?;
        for device in &mut devices {
            device.is_current = device.id == self.device_id;
        }
        Ok(Some(FamilyState {
            family,
            devices,
            members: doc.members.values_as()?,
            permissions: doc.permissions.values_as()?,
            current_device_id: self.device_id,
        }))
    }

    /// Whether this device holds the admin role.
    pub fn is_admin(&self) -> Result<bool, FamilyError> {
        Ok(member_role(&self.manager, self.device_id)? == Some(Role::Admin))
    }

    /// Register another device as a member. Admin only.
    pub fn add_device(&self, id: DeviceId, name: &str) -> Result<Device, FamilyError> {
        self.require_admin("add devices")?;
        let doc = self.manager.get_structure()?;
        let device = register(&doc, id, name, Role::Member, now_millis(), id == self.device_id)?;
        info!(device_id = %id, name, "device added");
        Ok(device)
    }

    /// Remove a device with its membership and role. Admin only.
    pub fn remove_device(&self, id: DeviceId) -> Result<(), FamilyError> {
        if id == self.device_id {
            return Err(FamilyError::SelfRemoval);
        }
        self.require_admin("remove devices")?;
        let doc = self.manager.get_structure()?;
        let key = id.to_string();
        if !doc.devices.remove(&key)? {
            return Err(FamilyError::UnknownDevice(id));
        }
        doc.members.remove(&key)?;
        doc.permissions.remove(&key)?;
        info!(device_id = %id, "device removed");
        Ok(())
    }

    /// Mint a single-use invitation granting `role`. Admin only.
    ///
    /// Any device may redeem it. Approvals bind their token to the requester
    /// instead, see [`issue_join_approval`](Self::issue_join_approval).
    pub async fn create_invitation(&self, role: Role) -> Result<Invitation, FamilyError> {
        self.mint(role, None).await
    }

    /// Invitations minted on this device, with their replicated status.
    pub async fn issued_invitations(&self) -> Result<Vec<Invitation>, FamilyError> {
        let doc = self.manager.get_structure()?;
        let mut issued = Vec::new();
        for key in self.store.keys_with_prefix(INVITE_PREFIX).await? {
            let token = &key[INVITE_PREFIX.len()..];
            if let Some(current) = doc.invitations.get_as::<Invitation>(token)? {
                issued.push(current);
                continue;
            }
            if let Some(bytes) = self.store.get(&key).await? {
                match serde_json::from_slice::<Invitation>(&bytes) {
                    Ok(invitation) => issued.push(invitation),
                    Err(e) => warn!(error = %e, "skipping unreadable invitation record"),
                }
            }
        }
        Ok(issued)
    }

    /// Attach a fresh invitation token, bound to `requester`, to an approval.
    /// Admin only.
    pub async fn issue_join_approval(
        &self,
        mut approval: JoinApproval,
        requester: DeviceId,
    ) -> Result<JoinApproval, FamilyError> {
        if !approval.approved {
            return Err(FamilyError::UnusableApproval("request was rejected"));
        }
        if approval.sync_token.is_some() {
            return Err(FamilyError::UnusableApproval("token already attached"));
        }
        let family = self.family()?.ok_or(FamilyError::NoFamily)?;
        if family.id != approval.family_id {
            return Err(FamilyError::UnusableApproval("approval is for another family"));
        }
        let invitation = self.mint(approval.role, Some(requester)).await?;
        approval.sync_token = Some(invitation.token);
        Ok(approval)
    }

    /// Adopt the family named in an approval before syncing with it.
    ///
    /// Records the family id so the coordinator can join the family's room,
    /// and keeps the token to present to the admin. [`join`](Self::join)
    /// confirms membership once the admin's grant has synced back.
    pub async fn prepare_join(&self, approval: &JoinApproval) -> Result<(), FamilyError> {
        if !approval.approved {
            return Err(FamilyError::UnusableApproval("request was rejected"));
        }
        let Some(token) = approval.sync_token.as_deref() else {
            return Err(FamilyError::UnusableApproval("no token attached"));
        };
        let current = DeviceIdentity::load_family_id(self.store.as_ref()).await?;
        if current.is_some_and(|id| id != approval.family_id) {
            return Err(FamilyError::AlreadyInFamily);
        }
        self.store.set(JOIN_TOKEN_KEY, token.as_bytes()).await?;
        if current.is_none() {
            DeviceIdentity::store_family_id(self.store.as_ref(), approval.family_id).await?;
            info!(family_id = %approval.family_id, "prepared to join family");
        }
        Ok(())
    }

    /// Token kept by [`prepare_join`](Self::prepare_join) until the join is
    /// confirmed.
    pub async fn pending_join_token(&self) -> Result<Option<String>, FamilyError> {
        Ok(get_string(self.store.as_ref(), JOIN_TOKEN_KEY).await?)
    }

    /// Confirm joining the family with the token this device was handed.
    ///
    /// Succeeds once: the admin must have redeemed the token for this device
    /// and the grant must have synced here. Unknown tokens, tokens redeemed by
    /// another device and repeated calls fail with
    /// [`FamilyError::InvalidToken`] and change nothing.
    pub async fn join(&self, token: &str) -> Result<FamilyState, FamilyError> {
        let doc = self.manager.get_structure()?;
        let pending = self.pending_join_token().await?;
        let stored = doc.invitations.get_as::<Invitation>(token)?;
        let redeemed_here = stored
            .as_ref()
            .is_some_and(|i| i.used && i.used_by == Some(self.device_id));
        if pending.as_deref() != Some(token) || !redeemed_here {
            warn!(pending = pending.is_some(), "join rejected");
            return Err(FamilyError::InvalidToken);
        }
        let family = doc
            .family
            .get_as::<Family>(FAMILY_KEY)?
            .ok_or(FamilyError::NoFamily)?;
        let role = member_role(&self.manager, self.device_id)?
            .ok_or(FamilyError::NotMember(self.device_id))?;

        DeviceIdentity::store_family_id(self.store.as_ref(), family.id).await?;
        self.store.delete(JOIN_TOKEN_KEY).await?;
        info!(family_id = %family.id, %role, "joined family");

        self.get_family_state()?.ok_or(FamilyError::NoFamily)
    }

    async fn mint(
        &self,
        role: Role,
        issued_to: Option<DeviceId>,
    ) -> Result<Invitation, FamilyError> {
        self.require_admin("create invitations")?;
        let doc = self.manager.get_structure()?;
        let token = self.tokens.generate_token(MIN_TOKEN_BYTES);
        let mut invitation = new_invitation(token, role, now_millis());
        invitation.issued_to = issued_to;

        doc.invitations.set_value(&invitation.token, &invitation)?;
        let bytes = serde_json::to_vec(&invitation).map_err(DocumentError::from)?;
        self.store
            .set(&format!("{INVITE_PREFIX}{}", invitation.token), &bytes)
            .await?;

        info!(%role, bound = issued_to.is_some(), "invitation created");
        Ok(invitation)
    }

    fn require_admin(&self, action: &'static str) -> Result<(), FamilyError> {
        if self.family()?.is_none() {
            return Err(FamilyError::NoFamily);
        }
        if !self.is_admin()? {
            return Err(FamilyError::NotAdmin(action));
        }
        Ok(())
    }
}

fn register(
    doc: &DocumentStructure,
    id: DeviceId,
    name: &str,
    role: Role,
    now: Timestamp,
    is_current: bool,
) -> Result<Device, FamilyError> {
    let key = id.to_string();
    let device = Device {
        id,
        name: name.to_string(),
        added_at: now,
        last_seen: now,
        is_current,
    };
    doc.devices.set_value(&key, &device)?;
    doc.members.set_value(
        &key,
        &Member {
            device_id: id,
            name: name.to_string(),
            joined_at: now,
        },
    )?;
    doc.permissions.set_value(
        &key,
        &Permission {
            device_id: id,
            role,
            granted_at: now,
        },
    )?;
    Ok(device)
}
