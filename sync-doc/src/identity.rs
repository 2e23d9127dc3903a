//! Device identity and invitation token generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::str::FromStr;
use sync_core::MIN_TOKEN_BYTES;
use sync_types::{DeviceId, FamilyId};
use tracing::info;

use crate::error::StoreError;
use crate::store::{get_string, KeyValueStore};

const DEVICE_ID_KEY: &str = "device/id";
const DEVICE_NAME_KEY: &str = "device/name";
const FAMILY_ID_KEY: &str = "settings/family_id";

/// Who this device is, and which family it syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Persisted random device id.
    pub device_id: DeviceId,
    /// Human-readable name.
    pub device_name: String,
    /// Active family, once created or joined.
    pub family_id: Option<FamilyId>,
}

impl DeviceIdentity {
    /// Load the identity, creating and persisting a device id on first run.
    pub async fn load_or_create(
        store: &dyn KeyValueStore,
        default_name: &str,
    ) -> Result<Self, StoreError> {
        let device_id = match get_string(store, DEVICE_ID_KEY).await? {
            Some(s) => DeviceId::from_str(&s).map_err(|e| StoreError::InvalidValue {
                key: DEVICE_ID_KEY.into(),
                reason: e.to_string(),
            })?,
            None => {
                let id = DeviceId::random();
                store.set(DEVICE_ID_KEY, id.to_string().as_bytes()).await?;
                info!(device_id = %id, "created device identity");
                id
            }
        };

        let device_name = match get_string(store, DEVICE_NAME_KEY).await? {
            Some(name) => name,
            None => {
                store.set(DEVICE_NAME_KEY, default_name.as_bytes()).await?;
                default_name.to_string()
            }
        };

        let family_id = Self::load_family_id(store).await?;

        Ok(Self {
            device_id,
            device_name,
            family_id,
        })
    }

    /// Read the active family setting.
    pub async fn load_family_id(store: &dyn KeyValueStore) -> Result<Option<FamilyId>, StoreError> {
        match get_string(store, FAMILY_ID_KEY).await? {
            Some(s) => FamilyId::from_str(&s)
                .map(Some)
                .map_err(|e| StoreError::InvalidValue {
                    key: FAMILY_ID_KEY.into(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Persist the active family setting.
    pub async fn store_family_id(
        store: &dyn KeyValueStore,
        family_id: FamilyId,
    ) -> Result<(), StoreError> {
        store
            .set(FAMILY_ID_KEY, family_id.to_string().as_bytes())
            .await
    }

    /// Forget the active family setting.
    pub async fn clear_family_id(store: &dyn KeyValueStore) -> Result<(), StoreError> {
        store.delete(FAMILY_ID_KEY).await
    }
}

/// Source of invitation tokens.
pub trait TokenGenerator: Send + Sync {
    /// Generate an opaque token from at least `len_bytes` random bytes.
    fn generate_token(&self, len_bytes: usize) -> String;
}

/// Cryptographically random tokens, URL-safe base64 encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokens;

impl TokenGenerator for RandomTokens {
    fn generate_token(&self, len_bytes: usize) -> String {
        let mut bytes = vec![0u8; len_bytes.max(MIN_TOKEN_BYTES)];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        URL_SAFE_NO_PAD.encode(bytes)
    }
}
