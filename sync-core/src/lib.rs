//! # sync-core
//!
//! Pure logic for Hearth family sync (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping for peer sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current time) and produce output without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk) is performed by `sync-client` and
//! `sync-doc`, which interpret the results produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod chunk;
pub mod expiry;
pub mod invite;
pub mod join;
pub mod lifecycle;
pub mod link;
pub mod retry;
pub mod throttle;

pub use buffer::{BufferError, OutboundUpdate, UpdateBuffer};
pub use chunk::{split_message, ChunkError, Reassembler, CHUNK_SIZE, MAX_REASSEMBLED_SIZE};
pub use expiry::{ExpiringMap, DEFAULT_DISCOVERY_TTL};
pub use invite::{new_invitation, redeem, InviteError, MIN_TOKEN_BYTES};
pub use join::{JoinError, JoinOutcome, JoinRegistry, RESOLVED_HISTORY};
pub use lifecycle::{CoordinatorState, LifecycleError};
pub use link::{LinkAction, LinkEvent, LinkNotice, PeerLinkState, ReconnectPolicy};
pub use retry::RetryPolicy;
pub use throttle::{StatusThrottle, DEFAULT_STATUS_WINDOW};
