//! Transport abstraction for peer links.
//!
//! A [`Connector`] opens duplex byte links to other devices: it listens for
//! inbound links and dials candidates found by discovery. Each link is a
//! [`Transport`] carrying whole protocol messages. Which family a link belongs
//! to is settled by the `Hello` exchange on top of the transport, so a
//! listener serves every family room the device takes part in.
//!
//! # Design
//!
//! - `send()` transmits one encoded [`PeerMessage`](sync_types::PeerMessage)
//! - `recv()` waits for the next message, or fails once the link is gone
//! - `close()` tears the link down; the remote side sees `ConnectionClosed`
//!
//! Sends and receives may run concurrently on the same link.

mod memory;
mod tcp;

pub use memory::{MemoryConnector, MemoryNetwork, MEMORY_HOST};
pub use tcp::TcpConnector;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Maximum message size (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Could not listen for inbound links.
    #[error("listen failed: {0}")]
    ListenFailed(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// One duplex link to a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next message.
    ///
    /// Blocks until data is available or the link closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;

    /// Close the link.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Source of inbound links.
#[async_trait]
pub trait Listener: Send {
    /// Port peers should dial, as advertised by discovery.
    fn local_port(&self) -> u16;

    /// Wait for the next inbound link.
    async fn accept(&mut self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Opens links to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start accepting links on `port` (0 picks a free port).
    async fn listen(&self, port: u16) -> Result<Box<dyn Listener>, TransportError>;

    /// Open a link to a peer.
    async fn dial(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, TransportError>;
}
