//! # sync-client
//!
//! Networked side of Hearth family sync.
//!
//! This is the library the sync daemon is built on. It keeps a device's
//! replicated family document in step with the other devices of the family.
//!
//! ## Features
//!
//! - **Peer Sync**: Direct links between family devices, state-vector
//!   handshake, acknowledged incremental updates and reconnection with backoff
//! - **Discovery**: Local-network beacons, family advertisements and an
//!   admin-approved join handshake
//! - **Transport Abstraction**: Pluggable links (TCP, in-memory for tests)
//! - **Pure State Machines**: Lifecycle and per-peer logic live in sync-core
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_client::{Config, SyncEngine, TcpConnector, UdpAdvertiser};
//! use sync_doc::SqliteStore;
//!
//! let config = Config::default();
//! let store = Arc::new(SqliteStore::new(&path).await?);
//! let advertiser = Arc::new(UdpAdvertiser::bind(config.discovery.port).await?);
//! let engine = SyncEngine::open(config, store, Arc::new(TcpConnector::new()), advertiser).await?;
//!
//! engine.start();
//! engine.create_family("Acme").await?;
//! // ...
//! engine.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod engine;
pub mod transport;

pub use config::{Config, ConfigError, DeviceConfig, DiscoveryConfig, ShutdownConfig, SyncConfig};
pub use coordinator::{CoordinatorConfig, CoordinatorError, PeerSyncCoordinator, SyncEvent};
pub use discovery::{
    Advertiser, DiscoveredDevice, DiscoveryError, DiscoveryEvent, DiscoveryService,
    DiscoveryTiming, MemoryAdvertiser, MemoryLan, ObservedBeacon, UdpAdvertiser,
};
pub use engine::{EngineError, ShutdownOutcome, SyncEngine};
pub use transport::{
    Connector, Listener, MemoryConnector, MemoryNetwork, TcpConnector, Transport,
    TransportError, MAX_MESSAGE_SIZE, MEMORY_HOST,
};
