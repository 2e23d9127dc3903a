//! # hearth-scenario-tests
//!
//! Multi-device scenario harness for Hearth family sync.
//!
//! Whole devices ([`SyncEngine`](sync_client::SyncEngine)s) run in one
//! process on an in-memory network and an in-memory LAN, so scenarios can
//! found families, walk through the join handshake, cut links and check that
//! every replica converges:
//!
//! - Family setup and the admin-approved join handshake
//! - Convergence across three devices
//! - Link failure on one peer while the others keep syncing
//! - Offline edits merging on reconnect
//! - Status event throttling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assertions;
pub mod topology;

#[cfg(test)]
mod scenarios;
