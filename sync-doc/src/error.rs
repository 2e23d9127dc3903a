//! Error types for the replicated document layer.

use sync_types::DeviceId;

/// Key-value store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backend refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be interpreted.
    #[error("invalid value under {key}: {reason}")]
    InvalidValue {
        /// Key holding the value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Failures while loading or saving the persisted document.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Another process holds the advisory lock.
    #[error("document locked by {holder} since {acquired_at}")]
    Locked {
        /// Lock holder id.
        holder: String,
        /// When the lock was taken (ms since epoch).
        acquired_at: u64,
    },

    /// The persisted snapshot or lock record is unreadable.
    #[error("persisted document is corrupt: {0}")]
    Corrupt(String),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the Document Replica Manager and collection handles.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Called before `initialize()` completed or after `close()`.
    #[error("document not initialized")]
    NotInitialized,

    /// Update bytes are not a valid encoding.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// State vector bytes are not a valid encoding.
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),

    /// Collection name is not part of the family document.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// A value in a collection is not a JSON document.
    #[error("invalid value in {collection}/{key}")]
    InvalidValue {
        /// Collection name.
        collection: String,
        /// Entry key.
        key: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage layer failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl From<StoreError> for DocumentError {
    fn from(err: StoreError) -> Self {
        DocumentError::Persistence(PersistenceError::Store(err))
    }
}

/// Errors from family management.
#[derive(Debug, thiserror::Error)]
pub enum FamilyError {
    /// No family record in the document.
    #[error("no family configured")]
    NoFamily,

    /// This device already belongs to a family.
    #[error("device already belongs to a family")]
    AlreadyInFamily,

    /// Token unknown or already used.
    #[error("invalid_token")]
    InvalidToken,

    /// The operation requires admin rights.
    #[error("admin rights required to {0}")]
    NotAdmin(&'static str),

    /// A device tried to remove itself.
    #[error("a device cannot remove itself")]
    SelfRemoval,

    /// Device is not registered in the family.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// A peer holds no role in the family and brought no usable invitation.
    #[error("device {0} is not a family member")]
    NotMember(DeviceId),

    /// The approval was a rejection or carries no token.
    #[error("join approval is not usable: {0}")]
    UnusableApproval(&'static str),

    /// Document failure.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
