//! Document Replica Manager.
//!
//! Owns the CRDT document of the active family: loads it from the key-value
//! store, hands out collection handles, produces and merges binary updates,
//! and persists snapshots. It is the only component that writes document
//! state to storage.
//!
//! ## Persistence layout
//!
//! | Key                         | Value                                   |
//! |-----------------------------|-----------------------------------------|
//! | `doc/active/snapshot`       | full state as a yrs v1 update           |
//! | `doc/active/lock`           | JSON advisory lock `{holder, acquiredAt}` |
//! | `doc/active/epoch`          | actor epoch, bumped by `force_unlock`   |
//! | `doc/active/quarantine/<t>` | unreadable snapshots moved aside        |
//!
//! The lock is advisory: it only stops two managers from opening the same
//! store. A lock left behind by a crashed process is cleared by
//! [`DocumentReplicaManager::force_unlock`], which is never called
//! automatically outside [`DocumentReplicaManager::initialize_with_recovery`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use sync_types::{now_millis, DeviceId};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::collection::{Collection, DocHandle, DocumentStructure};
use crate::error::{DocumentError, PersistenceError, StoreError};
use crate::store::{get_string, KeyValueStore};

const SNAPSHOT_KEY: &str = "doc/active/snapshot";
const LOCK_KEY: &str = "doc/active/lock";
const EPOCH_KEY: &str = "doc/active/epoch";
const QUARANTINE_PREFIX: &str = "doc/active/quarantine/";

/// Capacity of the update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A write through a collection handle or `apply_update`.
    Local,
    /// An update received from a connected peer.
    Peer(DeviceId),
}

/// A change applied to the document, as an encoded yrs v1 update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    /// Source of the change.
    pub origin: UpdateOrigin,
    /// Encoded update containing exactly the new operations.
    pub update: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvisoryLock {
    holder: Uuid,
    acquired_at: u64,
}

/// Owner of the family document.
pub struct DocumentReplicaManager {
    device_id: DeviceId,
    store: Arc<dyn KeyValueStore>,
    holder: Uuid,
    init: Mutex<()>,
    current: RwLock<Option<Arc<DocHandle>>>,
    updates: broadcast::Sender<DocumentUpdate>,
}

impl DocumentReplicaManager {
    /// Create a manager for `device_id` over `store`. Nothing is loaded yet.
    pub fn new(device_id: DeviceId, store: Arc<dyn KeyValueStore>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            device_id,
            store,
            holder: Uuid::new_v4(),
            init: Mutex::new(()),
            current: RwLock::new(None),
            updates,
        }
    }

    /// Device whose actor id writes local changes.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Whether `initialize()` has completed and `close()` has not been called.
    pub fn is_initialized(&self) -> bool {
        self.read_current().is_some()
    }

    /// Load the persisted document, or create an empty one.
    ///
    /// Concurrent calls are serialized; a caller arriving while another
    /// initialization is running waits for it and then returns immediately
    /// if it succeeded.
    pub async fn initialize(&self) -> Result<(), DocumentError> {
        let _guard = self.init.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        let handle = self.open().await?;
        *self.write_current() = Some(handle);
        info!(device_id = %self.device_id, "document initialized");
        Ok(())
    }

    /// `initialize()` with one recovery attempt.
    ///
    /// On a held lock, or a corrupt snapshot or lock record, the manager forces
    /// the lock open (moving an unreadable snapshot aside first) and retries
    /// once. Any other error, or a second failure, is returned. Only meant for
    /// explicit reset workflows.
    pub async fn initialize_with_recovery(&self) -> Result<(), DocumentError> {
        match self.initialize().await {
            Err(DocumentError::Persistence(PersistenceError::Locked { holder, .. })) => {
                warn!(%holder, "document locked, forcing unlock");
                self.force_unlock().await
            }
            Err(DocumentError::Persistence(PersistenceError::Corrupt(reason))) => {
                warn!(%reason, "persisted document corrupt, quarantining snapshot");
                self.quarantine_snapshot().await?;
                self.force_unlock().await
            }
            other => other,
        }
    }

    /// Clear the advisory lock and reopen the document from the last flush.
    ///
    /// Unflushed local operations are discarded. Handles obtained before the
    /// call stop working; fetch new ones with [`get_structure`](Self::get_structure).
    pub async fn force_unlock(&self) -> Result<(), DocumentError> {
        let _guard = self.init.lock().await;
        if let Some(old) = self.write_current().take() {
            if old.is_dirty() {
                warn!("discarding unflushed document changes");
            }
            old.close();
        }
        self.store.delete(LOCK_KEY).await?;
        self.bump_epoch().await?;
        let handle = self.open().await?;
        *self.write_current() = Some(handle);
        info!("document lock forced and document reopened");
        Ok(())
    }

    /// Handles to every collection.
    pub fn get_structure(&self) -> Result<DocumentStructure, DocumentError> {
        DocumentStructure::new(&self.handle()?)
    }

    /// Handle to one collection by name.
    pub fn get_map(&self, name: &str) -> Result<Collection, DocumentError> {
        self.handle()?.collection(name)
    }

    /// Encoded state vector of the local replica.
    pub fn get_state_vector(&self) -> Result<Vec<u8>, DocumentError> {
        Ok(self.handle()?.state_vector())
    }

    /// Encoded update: the full document, or the delta a replica at `since` lacks.
    pub fn get_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, DocumentError> {
        let handle = self.handle()?;
        let sv = match since {
            Some(bytes) => StateVector::decode_v1(bytes)
                .map_err(|e| DocumentError::InvalidStateVector(e.to_string()))?,
            None => StateVector::default(),
        };
        let txn = handle.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update produced by this host (IPC `applyUpdate`).
    pub fn apply_update(&self, update: &[u8]) -> Result<bool, DocumentError> {
        self.apply_remote_update(update, UpdateOrigin::Local)
    }

    /// Merge an update received from `origin`.
    ///
    /// Idempotent: re-applying known operations changes nothing and emits no
    /// [`DocumentUpdate`]. Returns whether the document changed.
    pub fn apply_remote_update(
        &self,
        update: &[u8],
        origin: UpdateOrigin,
    ) -> Result<bool, DocumentError> {
        let handle = self.handle()?;
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let delta = {
            let mut txn = handle.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
            txn.encode_update_v1()
        };
        if is_empty_update(&delta) {
            debug!(?origin, "update already known");
            return Ok(false);
        }
        handle.publish(origin, delta);
        Ok(true)
    }

    /// Whether `update` carries no operations.
    pub fn is_noop_update(update: &[u8]) -> Result<bool, DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        Ok(decoded.is_empty())
    }

    /// Receive every change applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentUpdate> {
        self.updates.subscribe()
    }

    /// All collections as JSON (IPC `getDocumentState`).
    pub fn document_state(&self) -> Result<Value, DocumentError> {
        self.handle()?.snapshot_json()
    }

    /// Persist the full snapshot if anything changed since the last flush.
    ///
    /// Returns whether a snapshot was written.
    pub async fn flush(&self) -> Result<bool, DocumentError> {
        let handle = self.handle()?;
        self.flush_handle(&handle).await
    }

    /// Flush and release the document. Later calls fail with `NotInitialized`.
    pub async fn close(&self) -> Result<(), DocumentError> {
        let _guard = self.init.lock().await;
        let handle = self.handle()?;
        self.flush_handle(&handle).await?;
        handle.close();
        self.write_current().take();
        self.release_lock().await?;
        info!("document closed");
        Ok(())
    }

    async fn flush_handle(&self, handle: &DocHandle) -> Result<bool, DocumentError> {
        if !handle.take_dirty() {
            return Ok(false);
        }
        let snapshot = handle.encode_full();
        if let Err(e) = self.store.set(SNAPSHOT_KEY, &snapshot).await {
            handle.mark_dirty();
            error!(error = %e, "failed to persist document snapshot");
            return Err(e.into());
        }
        debug!(bytes = snapshot.len(), "document snapshot persisted");
        Ok(true)
    }

    async fn open(&self) -> Result<Arc<DocHandle>, PersistenceError> {
        self.acquire_lock().await?;
        match self.load().await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(release) = self.release_lock().await {
                    warn!(error = %release, "failed to release lock after load failure");
                }
                Err(e)
            }
        }
    }

    async fn load(&self) -> Result<Arc<DocHandle>, PersistenceError> {
        let epoch = self.epoch().await?;
        let doc = Doc::with_client_id(self.device_id.actor_id_in_epoch(epoch));
        let handle = DocHandle::new(doc, self.updates.clone());

        if let Some(snapshot) = self.store.get(SNAPSHOT_KEY).await? {
            let update = Update::decode_v1(&snapshot)
                .map_err(|e| PersistenceError::Corrupt(format!("snapshot: {e}")))?;
            handle
                .doc
                .transact_mut()
                .apply_update(update)
                .map_err(|e| PersistenceError::Corrupt(format!("snapshot: {e}")))?;
            debug!(bytes = snapshot.len(), epoch, "document rehydrated");
        }
        Ok(handle)
    }

    async fn acquire_lock(&self) -> Result<(), PersistenceError> {
        if let Some(bytes) = self.store.get(LOCK_KEY).await? {
            let lock: AdvisoryLock = serde_json::from_slice(&bytes)
                .map_err(|e| PersistenceError::Corrupt(format!("lock record: {e}")))?;
            if lock.holder != self.holder {
                return Err(PersistenceError::Locked {
                    holder: lock.holder.to_string(),
                    acquired_at: lock.acquired_at,
                });
            }
        }
        let lock = AdvisoryLock {
            holder: self.holder,
            acquired_at: now_millis(),
        };
        let bytes =
            serde_json::to_vec(&lock).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        self.store.set(LOCK_KEY, &bytes).await?;
        Ok(())
    }

    async fn release_lock(&self) -> Result<(), StoreError> {
        if let Some(bytes) = self.store.get(LOCK_KEY).await? {
            let ours = serde_json::from_slice::<AdvisoryLock>(&bytes)
                .map(|lock| lock.holder == self.holder)
                .unwrap_or(false);
            if ours {
                self.store.delete(LOCK_KEY).await?;
            }
        }
        Ok(())
    }

    async fn epoch(&self) -> Result<u32, StoreError> {
        match get_string(self.store.as_ref(), EPOCH_KEY).await? {
            Some(s) => s.parse().map_err(|_| StoreError::InvalidValue {
                key: EPOCH_KEY.into(),
                reason: format!("not a number: {s}"),
            }),
            None => Ok(0),
        }
    }

    async fn bump_epoch(&self) -> Result<(), StoreError> {
        // An unreadable epoch is replaced rather than blocking recovery.
        let next = self.epoch().await.unwrap_or(0).wrapping_add(1);
        self.store.set(EPOCH_KEY, next.to_string().as_bytes()).await
    }

    async fn quarantine_snapshot(&self) -> Result<(), StoreError> {
        if let Some(bytes) = self.store.get(SNAPSHOT_KEY).await? {
            let key = format!("{QUARANTINE_PREFIX}{}", now_millis());
            self.store.set(&key, &bytes).await?;
            self.store.delete(SNAPSHOT_KEY).await?;
            warn!(%key, "moved unreadable snapshot aside");
        }
        Ok(())
    }

    fn handle(&self) -> Result<Arc<DocHandle>, DocumentError> {
        self.read_current()
            .clone()
            .ok_or(DocumentError::NotInitialized)
    }

    fn read_current(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<DocHandle>>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_current(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<DocHandle>>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_empty_update(update: &[u8]) -> bool {
    Update::decode_v1(update)
        .map(|u| u.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn device(b: u8) -> DeviceId {
        DeviceId::from_bytes(&[b; 32]).unwrap()
    }

    async fn manager(b: u8) -> (DocumentReplicaManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = DocumentReplicaManager::new(device(b), store.clone());
        manager.initialize().await.unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn operations_before_initialize_fail() {
        let manager = DocumentReplicaManager::new(device(1), Arc::new(MemoryStore::new()));

        assert!(matches!(
            manager.get_structure(),
            Err(DocumentError::NotInitialized)
        ));
        assert!(matches!(
            manager.get_state_vector(),
            Err(DocumentError::NotInitialized)
        ));
        assert!(matches!(
            manager.flush().await,
            Err(DocumentError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn concurrent_initialize_is_serialized() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = Arc::new(DocumentReplicaManager::new(device(1), store));

        let a = tokio::spawn({
            let m = manager.clone();
            async move { m.initialize().await }
        });
        let b = tokio::spawn({
            let m = manager.clone();
            async move { m.initialize().await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert!(manager.is_initialized());
    }

    #[tokio::test]
    async fn writes_are_read_back() {
        let (manager, _) = manager(1).await;
        let tasks = manager.get_structure().unwrap().tasks;

        tasks.set("t1", &json!({"title": "Buy milk"})).unwrap();

        assert_eq!(tasks.get("t1").unwrap(), Some(json!({"title": "Buy milk"})));
        assert_eq!(tasks.keys().unwrap(), vec!["t1".to_string()]);
        assert_eq!(tasks.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_collection_is_rejected() {
        let (manager, _) = manager(1).await;
        assert!(matches!(
            manager.get_map("recipes"),
            Err(DocumentError::UnknownCollection(_))
        ));
        assert_eq!(manager.get_map("taskLists").unwrap().name(), "taskLists");
    }

    #[tokio::test]
    async fn replicas_converge_in_any_order() {
        let (a, _) = manager(1).await;
        let (b, _) = manager(2).await;
        let (c, _) = manager(3).await;

        a.get_map("events").unwrap().set("e1", &json!({"at": 1})).unwrap();
        b.get_map("events").unwrap().set("e2", &json!({"at": 2})).unwrap();
        let ua = a.get_update(None).unwrap();
        let ub = b.get_update(None).unwrap();

        // c gets b's update first, a's second; a and b exchange directly
        c.apply_update(&ub).unwrap();
        c.apply_update(&ua).unwrap();
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        let state = a.document_state().unwrap();
        assert_eq!(b.document_state().unwrap(), state);
        assert_eq!(c.document_state().unwrap(), state);
        assert_eq!(
            StateVector::decode_v1(&a.get_state_vector().unwrap()).unwrap(),
            StateVector::decode_v1(&c.get_state_vector().unwrap()).unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_key_pick_one_whole_value() {
        let (a, _) = manager(1).await;
        let (b, _) = manager(2).await;

        a.get_map("tasks")
            .unwrap()
            .set("t1", &json!({"title": "A", "done": false}))
            .unwrap();
        b.get_map("tasks")
            .unwrap()
            .set("t1", &json!({"title": "B", "done": true}))
            .unwrap();
        let ua = a.get_update(None).unwrap();
        let ub = b.get_update(None).unwrap();
        a.apply_update(&ub).unwrap();
        b.apply_update(&ua).unwrap();

        let va = a.get_map("tasks").unwrap().get("t1").unwrap().unwrap();
        let vb = b.get_map("tasks").unwrap().get("t1").unwrap().unwrap();
        assert_eq!(va, vb);
        assert!(
            va == json!({"title": "A", "done": false}) || va == json!({"title": "B", "done": true})
        );
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let (a, _) = manager(1).await;
        let (b, _) = manager(2).await;
        a.get_map("tasks").unwrap().set("t1", &json!(1)).unwrap();
        a.get_map("tasks").unwrap().remove("t1").unwrap();
        a.get_map("tasks").unwrap().set("t2", &json!(2)).unwrap();
        let update = a.get_update(None).unwrap();

        assert!(b.apply_update(&update).unwrap());
        let once = b.document_state().unwrap();
        assert!(!b.apply_update(&update).unwrap());
        assert_eq!(b.document_state().unwrap(), once);
    }

    #[tokio::test]
    async fn delta_against_own_state_vector_is_noop() {
        let (a, _) = manager(1).await;
        a.get_map("calendars").unwrap().set("c", &json!({})).unwrap();

        let sv = a.get_state_vector().unwrap();
        let delta = a.get_update(Some(&sv)).unwrap();
        assert!(DocumentReplicaManager::is_noop_update(&delta).unwrap());
        assert!(!DocumentReplicaManager::is_noop_update(&a.get_update(None).unwrap()).unwrap());
    }

    #[tokio::test]
    async fn delta_contains_only_missing_operations() {
        let (a, _) = manager(1).await;
        let (b, _) = manager(2).await;
        a.get_map("tasks").unwrap().set("t1", &json!(1)).unwrap();
        b.apply_update(&a.get_update(None).unwrap()).unwrap();

        a.get_map("tasks").unwrap().set("t2", &json!(2)).unwrap();
        let delta = a.get_update(Some(&b.get_state_vector().unwrap())).unwrap();

        assert!(delta.len() < a.get_update(None).unwrap().len());
        b.apply_update(&delta).unwrap();
        assert_eq!(b.document_state().unwrap(), a.document_state().unwrap());
    }

    #[tokio::test]
    async fn corrupt_update_is_rejected() {
        let (a, _) = manager(1).await;
        assert!(matches!(
            a.apply_update(&[0xff, 0xff, 0xff, 0xff, 0x01]),
            Err(DocumentError::InvalidUpdate(_))
        ));
        assert!(matches!(
            a.get_update(Some(&[0xff, 0xff, 0xff])),
            Err(DocumentError::InvalidStateVector(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_see_local_and_remote_changes() {
        let (a, _) = manager(1).await;
        let (b, _) = manager(2).await;
        let mut rx = b.subscribe();

        b.get_map("tasks").unwrap().set("mine", &json!(1)).unwrap();
        let local = rx.recv().await.unwrap();
        assert_eq!(local.origin, UpdateOrigin::Local);

        a.get_map("tasks").unwrap().set("theirs", &json!(2)).unwrap();
        b.apply_remote_update(&a.get_update(None).unwrap(), UpdateOrigin::Peer(device(1)))
            .unwrap();
        let remote = rx.recv().await.unwrap();
        assert_eq!(remote.origin, UpdateOrigin::Peer(device(1)));
        assert!(!DocumentReplicaManager::is_noop_update(&remote.update).unwrap());
    }

    #[tokio::test]
    async fn flush_persists_and_reload_rehydrates() {
        let (a, store) = manager(1).await;
        a.get_map("members").unwrap().set("m", &json!({"name": "Ann"})).unwrap();

        assert!(a.flush().await.unwrap());
        assert!(!a.flush().await.unwrap());
        a.close().await.unwrap();

        let reopened = DocumentReplicaManager::new(device(1), store);
        reopened.initialize().await.unwrap();
        assert_eq!(
            reopened.get_map("members").unwrap().get("m").unwrap(),
            Some(json!({"name": "Ann"}))
        );
    }

    #[tokio::test]
    async fn close_invalidates_handles() {
        let (a, _) = manager(1).await;
        let tasks = a.get_map("tasks").unwrap();
        a.close().await.unwrap();

        assert!(matches!(tasks.get("x"), Err(DocumentError::NotInitialized)));
        assert!(matches!(
            a.get_state_vector(),
            Err(DocumentError::NotInitialized)
        ));
        assert!(matches!(a.close().await, Err(DocumentError::NotInitialized)));
    }

    #[tokio::test]
    async fn second_manager_sees_lock() {
        let (_a, store) = manager(1).await;
        let other = DocumentReplicaManager::new(device(1), store);

        assert!(matches!(
            other.initialize().await,
            Err(DocumentError::Persistence(PersistenceError::Locked { .. }))
        ));
        assert!(!other.is_initialized());
    }

    #[tokio::test]
    async fn recovery_forces_stale_lock() {
        let (a, store) = manager(1).await;
        a.get_map("tasks").unwrap().set("kept", &json!(1)).unwrap();
        a.flush().await.unwrap();
        // Simulate a crash: the lock stays behind.
        drop(a);

        let restarted = DocumentReplicaManager::new(device(1), store);
        restarted.initialize_with_recovery().await.unwrap();
        assert_eq!(
            restarted.get_map("tasks").unwrap().get("kept").unwrap(),
            Some(json!(1))
        );
    }

    #[tokio::test]
    async fn force_unlock_discards_unflushed_changes() {
        let (a, _) = manager(1).await;
        let tasks = a.get_map("tasks").unwrap();
        tasks.set("flushed", &json!(1)).unwrap();
        a.flush().await.unwrap();
        tasks.set("lost", &json!(2)).unwrap();

        a.force_unlock().await.unwrap();

        let tasks = a.get_map("tasks").unwrap();
        assert_eq!(tasks.keys().unwrap(), vec!["flushed".to_string()]);
    }

    #[tokio::test]
    async fn force_unlock_moves_to_new_actor() {
        let (a, _) = manager(1).await;
        let sv_before = a.get_state_vector().unwrap();
        a.get_map("tasks").unwrap().set("x", &json!(1)).unwrap();
        a.flush().await.unwrap();
        a.force_unlock().await.unwrap();
        a.get_map("tasks").unwrap().set("y", &json!(2)).unwrap();

        let sv = StateVector::decode_v1(&a.get_state_vector().unwrap()).unwrap();
        assert!(sv.get(&device(1).actor_id_in_epoch(0)) > 0);
        assert!(sv.get(&device(1).actor_id_in_epoch(1)) > 0);
        assert_ne!(sv_before, a.get_state_vector().unwrap());
    }

    #[tokio::test]
    async fn corrupt_snapshot_surfaces_then_recovers() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("doc/active/snapshot", &[0xde, 0xad, 0xbe, 0xef])
            .await
            .unwrap();

        let manager = DocumentReplicaManager::new(device(1), store.clone());
        assert!(matches!(
            manager.initialize().await,
            Err(DocumentError::Persistence(PersistenceError::Corrupt(_)))
        ));
        // Failed open does not leave our lock behind.
        assert_eq!(store.get("doc/active/lock").await.unwrap(), None);

        manager.initialize_with_recovery().await.unwrap();
        assert!(manager.is_initialized());
        assert_eq!(
            store
                .keys_with_prefix("doc/active/quarantine/")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn flush_failure_is_surfaced_and_retried() {
        let (a, store) = manager(1).await;
        a.get_map("tasks").unwrap().set("x", &json!(1)).unwrap();
        store.set_fail_writes(true);

        assert!(matches!(
            a.flush().await,
            Err(DocumentError::Persistence(PersistenceError::Store(_)))
        ));

        store.set_fail_writes(false);
        assert!(a.flush().await.unwrap());
    }
}
