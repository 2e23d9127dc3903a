//! Data-model records shared by the document, coordinator and discovery layers.
//!
//! Records stored in the replicated document serialize with camelCase keys so
//! documents written by other clients of the same family read back unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DeviceId, FamilyId, RequestId};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Role granted to a device within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control, may approve joins and mint invitations.
    Admin,
    /// Regular family member.
    Member,
    /// Member with restricted rights.
    Child,
    /// Read-only access.
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Child => "child",
            Role::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

/// The singleton family record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Family {
    /// Family identifier.
    pub id: FamilyId,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Device that created the family.
    pub created_by: DeviceId,
}

/// A device registered in a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device identifier (also the CRDT actor).
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// When the device joined the family.
    pub added_at: Timestamp,
    /// Last time the device read the family state.
    pub last_seen: Timestamp,
    /// Whether this record describes the local device. Computed on read.
    #[serde(default, skip_serializing)]
    pub is_current: bool,
}

/// A family member entry, one per device that joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Device the member uses.
    pub device_id: DeviceId,
    /// Display name.
    pub name: String,
    /// When the member joined.
    pub joined_at: Timestamp,
}

/// Role assignment for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Device holding the role.
    pub device_id: DeviceId,
    /// Granted role.
    pub role: Role,
    /// When the role was granted.
    pub granted_at: Timestamp,
}

/// A single-use invitation token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    /// Opaque random token.
    pub token: String,
    /// Role granted on join.
    pub role: Role,
    /// Creation time.
    pub created_at: Timestamp,
    /// Flips to `true` permanently on first successful join.
    pub used: bool,
    /// Device that consumed the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<DeviceId>,
    /// When the token was consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<Timestamp>,
    /// Device the token was handed to, if it is bound to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_to: Option<DeviceId>,
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("token", &"[REDACTED]")
            .field("role", &self.role)
            .field("created_at", &self.created_at)
            .field("used", &self.used)
            .field("used_by", &self.used_by)
            .field("issued_to", &self.issued_to)
            .finish()
    }
}

/// Connection status of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Known candidate, no link yet.
    Discovered,
    /// Link being opened.
    Connecting,
    /// Handshake completed.
    Connected,
    /// Link lost or closed.
    Disconnected,
}

/// Transient record of a peer link. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnection {
    /// Remote device.
    pub device_id: DeviceId,
    /// Remote device name.
    pub device_name: String,
    /// Current link status.
    pub status: PeerStatus,
    /// Last time anything was received from the peer.
    pub last_seen: Timestamp,
    /// Last time the peer acknowledged our state.
    pub last_sync_at: Option<Timestamp>,
}

/// A device found on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    /// Advertised device.
    pub device_id: DeviceId,
    /// Advertised name.
    pub name: String,
    /// Host to dial.
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// When the advertisement was first seen.
    pub discovered_at: Timestamp,
}

/// A family advertised on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFamily {
    /// Advertised family.
    pub family_id: FamilyId,
    /// Advertised family name.
    pub name: String,
    /// Admin device publishing the family.
    pub admin_device_id: DeviceId,
    /// Host to reach the admin device.
    pub host: String,
    /// Port to reach the admin device.
    pub port: u16,
    /// When the advertisement was first seen.
    pub discovered_at: Timestamp,
}

/// A pending request from a device that wants to join a family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Request identifier.
    pub id: RequestId,
    /// Requesting device.
    pub device_id: DeviceId,
    /// Requesting device name.
    pub device_name: String,
    /// Target family, when known to the requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<FamilyId>,
    /// When the request was created.
    pub requested_at: Timestamp,
}

/// Admin decision on a join request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinApproval {
    /// The request being answered.
    pub request_id: RequestId,
    /// Whether the request was approved.
    pub approved: bool,
    /// Granted role.
    pub role: Role,
    /// Family joined.
    pub family_id: FamilyId,
    /// Family name.
    pub family_name: String,
    /// Single-use invitation token, attached by the family service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl fmt::Debug for JoinApproval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinApproval")
            .field("request_id", &self.request_id)
            .field("approved", &self.approved)
            .field("role", &self.role)
            .field("family_id", &self.family_id)
            .field("family_name", &self.family_name)
            .field("sync_token", &self.sync_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Overall sync state reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Not syncing.
    Offline,
    /// Opening links, no peer yet.
    Connecting,
    /// At least one peer connected.
    Connected,
    /// Some peers connected, others reconnecting.
    Degraded,
}

/// Snapshot of the coordinator's sync status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Aggregate state.
    pub status: SyncState,
    /// Number of connected peers.
    pub peer_count: usize,
    /// Last acknowledged sync with any peer.
    pub last_sync_at: Option<Timestamp>,
    /// Best-effort error for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncStatus {
    /// The status of a coordinator that is not running.
    pub fn offline() -> Self {
        Self {
            status: SyncState::Offline,
            peer_count: 0,
            last_sync_at: None,
            error: None,
        }
    }
}
