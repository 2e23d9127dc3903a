//! # sync-doc
//!
//! The replicated family document for Hearth sync.
//!
//! This crate owns the CRDT document every device of a family replicates:
//!
//! - [`DocumentReplicaManager`] - Loads, persists and merges the document
//! - [`Collection`] / [`DocumentStructure`] - Named maps of JSON values
//! - [`FamilyService`] - Family creation, devices, roles and invitations
//! - [`KeyValueStore`] - Storage contract, with [`MemoryStore`] and [`SqliteStore`]
//! - [`DeviceIdentity`] / [`TokenGenerator`] - Local identity and token minting
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_doc::{DocumentReplicaManager, SqliteStore, DeviceIdentity};
//!
//! let store = Arc::new(SqliteStore::new(&path).await?);
//! let identity = DeviceIdentity::load_or_create(store.as_ref(), "Laptop").await?;
//! let manager = DocumentReplicaManager::new(identity.device_id, store);
//! manager.initialize().await?;
//!
//! let tasks = manager.get_structure()?.tasks;
//! tasks.set("t1", &serde_json::json!({"title": "Buy milk"}))?;
//! manager.flush().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod error;
pub mod family;
pub mod identity;
pub mod manager;
pub mod store;

pub use collection::{Collection, DocumentStructure, COLLECTIONS, FAMILY_KEY};
pub use error::{DocumentError, FamilyError, PersistenceError, StoreError};
pub use family::{admit_peer, member_role, Admission, FamilyService, FamilyState};
pub use identity::{DeviceIdentity, RandomTokens, TokenGenerator};
pub use manager::{DocumentReplicaManager, DocumentUpdate, UpdateOrigin};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
