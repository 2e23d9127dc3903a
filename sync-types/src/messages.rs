//! Peer-to-peer protocol messages and discovery beacons.
//!
//! [`PeerMessage`] travels over an established peer link and is encoded as
//! MessagePack. [`Beacon`] is broadcast on the local network for discovery and
//! is encoded as JSON so other tools can read it. Join requests and replies
//! ride on beacons too, addressed to a single device.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DeviceId, FamilyId, SyncError};

/// Current peer protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Messages exchanged between two connected peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Opening handshake, sent by both sides.
    Hello(Hello),
    /// Request for everything the sender is missing.
    SyncStep1 {
        /// Sender's encoded state vector.
        state_vector: Vec<u8>,
    },
    /// Answer to `Hello` or `SyncStep1`: the diff the receiver lacks.
    SyncStep2 {
        /// Encoded update.
        update: Vec<u8>,
    },
    /// Incremental update produced after the handshake.
    Update {
        /// Per-link sequence number.
        seq: u64,
        /// Encoded update.
        update: Vec<u8>,
    },
    /// Acknowledges every update up to `seq`.
    Ack {
        /// Highest sequence applied.
        seq: u64,
        /// Receiver's state vector after applying.
        state_vector: Vec<u8>,
    },
    /// Ephemeral presence state. Never persisted.
    Awareness {
        /// Device the presence belongs to.
        device_id: DeviceId,
        /// JSON-encoded presence value.
        state: String,
    },
    /// Graceful disconnect.
    Bye {
        /// Optional reason for logs.
        reason: Option<String>,
    },
    /// One piece of a message too large for a single frame.
    ///
    /// Pieces of one message are sent back to back; the receiver decodes the
    /// concatenated `data` once piece `total - 1` has arrived.
    Chunk {
        /// Position of this piece, from 0.
        index: u32,
        /// Number of pieces in the message.
        total: u32,
        /// Slice of the encoded message.
        data: Vec<u8>,
    },
}

impl PeerMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello(_) => "hello",
            PeerMessage::SyncStep1 { .. } => "sync-step-1",
            PeerMessage::SyncStep2 { .. } => "sync-step-2",
            PeerMessage::Update { .. } => "update",
            PeerMessage::Ack { .. } => "ack",
            PeerMessage::Awareness { .. } => "awareness",
            PeerMessage::Bye { .. } => "bye",
            PeerMessage::Chunk { .. } => "chunk",
        }
    }
}

/// Handshake payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Sending device
    pub device_id: DeviceId,
    /// Human-readable device name
    pub device_name: String,
    /// Family (room) the sender syncs
    pub family_id: FamilyId,
    /// Sender's encoded state vector
    pub state_vector: Vec<u8>,
    /// Invitation token, sent by a device that is not a member yet
    #[serde(default)]
    pub sync_token: Option<String>,
}

impl fmt::Debug for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hello")
            .field("version", &self.version)
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("family_id", &self.family_id)
            .field("sync_token", &self.sync_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

/// Family advertised alongside a device beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyAdvert {
    /// Advertised family
    pub family_id: FamilyId,
    /// Family display name
    pub name: String,
}

/// Local-network discovery beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Beacon {
    /// A device is present and reachable on `port`.
    Announce {
        /// Advertising device
        device_id: DeviceId,
        /// Device name
        device_name: String,
        /// Port the device accepts peer links on
        port: u16,
        /// Family published by this device, if it is an admin publishing one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        family: Option<FamilyAdvert>,
        /// Family this device syncs, if it belongs to one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member_of: Option<FamilyId>,
    },
    /// The device stopped publishing.
    Withdraw {
        /// Device going away
        device_id: DeviceId,
    },
    /// A device asks an admin to let it into a family.
    JoinRequest {
        /// Admin device the request is addressed to
        to: DeviceId,
        /// The request
        request: crate::JoinRequest,
    },
    /// An admin answers a join request.
    JoinReply {
        /// Answering admin device
        device_id: DeviceId,
        /// Requesting device
        to: DeviceId,
        /// The decision
        approval: crate::JoinApproval,
    },
}

impl Beacon {
    /// Encode as JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::Beacon)
    }

    /// Decode from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::Beacon)
    }

    /// Device that sent the beacon.
    pub fn device_id(&self) -> DeviceId {
        match self {
            Beacon::Announce { device_id, .. }
            | Beacon::Withdraw { device_id }
            | Beacon::JoinReply { device_id, .. } => *device_id,
            Beacon::JoinRequest { request, .. } => request.device_id,
        }
    }

    /// Device a join beacon is addressed to. `None` for broadcasts.
    pub fn recipient(&self) -> Option<DeviceId> {
        match self {
            Beacon::JoinRequest { to, .. } | Beacon::JoinReply { to, .. } => Some(*to),
            Beacon::Announce { .. } | Beacon::Withdraw { .. } => None,
        }
    }
}
