//! # sync-types
//!
//! Shared types for Hearth family sync.
//!
//! This crate provides the foundational types used across all Hearth sync crates:
//! - [`DeviceId`], [`FamilyId`], [`RequestId`] - Identity types
//! - [`Family`], [`Device`], [`Permission`], [`Invitation`], ... - Data-model records
//! - [`PeerMessage`] - Peer protocol messages (Hello, SyncStep1, Update, ...)
//! - [`Beacon`] - Local-network discovery beacons
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod records;

pub use error::SyncError;
pub use ids::{DeviceId, FamilyId, RequestId};
pub use messages::{Beacon, FamilyAdvert, Hello, PeerMessage, PROTOCOL_VERSION};
pub use records::{
    now_millis, Device, DiscoveredFamily, DiscoveredPeer, Family, Invitation, JoinApproval,
    JoinRequest, Member, PeerConnection, PeerStatus, Permission, Role, SyncState, SyncStatus,
    Timestamp,
};
