//! Error types for Hearth sync wire and identity types.

use thiserror::Error;

/// Errors raised while encoding, decoding or parsing shared types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Discovery beacon could not be encoded or decoded
    #[error("beacon encoding failed: {0}")]
    Beacon(#[source] serde_json::Error),

    /// Peer speaks a protocol version we do not understand
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}
