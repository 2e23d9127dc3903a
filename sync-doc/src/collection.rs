//! Named collections of the family document.
//!
//! Each collection is a CRDT map from an opaque string key to a full JSON
//! document. Writes always replace the whole value under a key; concurrent
//! writes to the same key converge to one winner on every replica.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact};

use crate::error::DocumentError;
use crate::manager::{DocumentUpdate, UpdateOrigin};

/// Names of every collection in the family document.
pub const COLLECTIONS: [&str; 10] = [
    "family",
    "devices",
    "members",
    "permissions",
    "invitations",
    "calendars",
    "events",
    "taskLists",
    "tasks",
    "emailLabels",
];

/// Key of the singleton record in the `family` collection.
pub const FAMILY_KEY: &str = "family";

/// Live document shared by the manager and every collection handle.
pub(crate) struct DocHandle {
    pub(crate) doc: Doc,
    maps: HashMap<&'static str, MapRef>,
    dirty: AtomicBool,
    open: AtomicBool,
    updates: broadcast::Sender<DocumentUpdate>,
}

impl DocHandle {
    pub(crate) fn new(doc: Doc, updates: broadcast::Sender<DocumentUpdate>) -> Arc<Self> {
        let maps = COLLECTIONS
            .iter()
            .map(|name| (*name, doc.get_or_insert_map(*name)))
            .collect();
        Arc::new(Self {
            doc,
            maps,
            dirty: AtomicBool::new(false),
            open: AtomicBool::new(true),
            updates,
        })
    }

    pub(crate) fn collection(self: &Arc<Self>, name: &str) -> Result<Collection, DocumentError> {
        let (name, map) = self
            .maps
            .get_key_value(name)
            .ok_or_else(|| DocumentError::UnknownCollection(name.to_string()))?;
        Ok(Collection {
            name: *name,
            map: map.clone(),
            handle: Arc::clone(self),
        })
    }

    pub(crate) fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub(crate) fn encode_full(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub(crate) fn publish(&self, origin: UpdateOrigin, update: Vec<u8>) {
        self.dirty.store(true, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.updates.send(DocumentUpdate { origin, update });
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn ensure_open(&self) -> Result<(), DocumentError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DocumentError::NotInitialized)
        }
    }

    pub(crate) fn snapshot_json(&self) -> Result<Value, DocumentError> {
        let txn = self.doc.transact();
        let mut root = serde_json::Map::new();
        for name in COLLECTIONS {
            let map = &self.maps[name];
            let mut entries = serde_json::Map::new();
            for key in map.keys(&txn) {
                if let Some(out) = map.get(&txn, key) {
                    entries.insert(key.to_string(), decode_value(out, name, key)?);
                }
            }
            root.insert(name.to_string(), Value::Object(entries));
        }
        Ok(Value::Object(root))
    }
}

fn decode_value(out: Out, collection: &str, key: &str) -> Result<Value, DocumentError> {
    match out {
        // Values are written as JSON text; plain strings from other writers pass through.
        Out::Any(Any::String(s)) => {
            Ok(serde_json::from_str(&s).unwrap_or_else(|_| Value::String(s.to_string())))
        }
        Out::Any(any) => Ok(serde_json::to_value(&any)?),
        _ => Err(DocumentError::InvalidValue {
            collection: collection.to_string(),
            key: key.to_string(),
        }),
    }
}

/// Handle to one named collection.
///
/// Handles stay valid across reads; after the manager is closed every
/// operation fails with [`DocumentError::NotInitialized`].
#[derive(Clone)]
pub struct Collection {
    name: &'static str,
    map: MapRef,
    handle: Arc<DocHandle>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl Collection {
    /// Collection name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read the JSON value under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Value>, DocumentError> {
        self.handle.ensure_open()?;
        let txn = self.handle.doc.transact();
        match self.map.get(&txn, key) {
            Some(out) => decode_value(out, self.name, key).map(Some),
            None => Ok(None),
        }
    }

    /// Read and deserialize the value under `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DocumentError> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Replace the whole value under `key`.
    pub fn set(&self, key: &str, value: &Value) -> Result<(), DocumentError> {
        self.handle.ensure_open()?;
        let json = serde_json::to_string(value)?;
        let update = {
            let mut txn = self.handle.doc.transact_mut();
            self.map.insert(&mut txn, key.to_string(), json);
            txn.encode_update_v1()
        };
        self.handle.publish(UpdateOrigin::Local, update);
        Ok(())
    }

    /// Serialize `value` and replace the whole value under `key`.
    pub fn set_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), DocumentError> {
        self.set(key, &serde_json::to_value(value)?)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool, DocumentError> {
        self.handle.ensure_open()?;
        let (removed, update) = {
            let mut txn = self.handle.doc.transact_mut();
            let removed = self.map.remove(&mut txn, key).is_some();
            (removed, txn.encode_update_v1())
        };
        if removed {
            self.handle.publish(UpdateOrigin::Local, update);
        }
        Ok(removed)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>, DocumentError> {
        self.handle.ensure_open()?;
        let txn = self.handle.doc.transact();
        let mut keys: Vec<String> = self.map.keys(&txn).map(str::to_string).collect();
        keys.sort();
        Ok(keys)
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Result<Vec<(String, Value)>, DocumentError> {
        self.handle.ensure_open()?;
        let txn = self.handle.doc.transact();
        let mut entries = Vec::new();
        for key in self.map.keys(&txn) {
            if let Some(out) = self.map.get(&txn, key) {
                entries.push((key.to_string(), decode_value(out, self.name, key)?));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Deserialize every entry, skipping values of another shape.
    pub fn values_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, DocumentError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize, DocumentError> {
        self.handle.ensure_open()?;
        let txn = self.handle.doc.transact();
        Ok(self.map.len(&txn) as usize)
    }

    /// Whether the collection has no entries.
    pub fn is_empty(&self) -> Result<bool, DocumentError> {
        Ok(self.len()? == 0)
    }
}

/// Handles to every collection of the family document.
#[derive(Debug, Clone)]
pub struct DocumentStructure {
    /// Singleton family record under [`FAMILY_KEY`].
    pub family: Collection,
    /// Registered devices.
    pub devices: Collection,
    /// Family members.
    pub members: Collection,
    /// Role grants keyed by device id.
    pub permissions: Collection,
    /// Invitations keyed by token.
    pub invitations: Collection,
    /// Calendars.
    pub calendars: Collection,
    /// Calendar events.
    pub events: Collection,
    /// Task lists.
    pub task_lists: Collection,
    /// Tasks.
    pub tasks: Collection,
    /// Email labels.
    pub email_labels: Collection,
}

impl DocumentStructure {
    pub(crate) fn new(handle: &Arc<DocHandle>) -> Result<Self, DocumentError> {
        Ok(Self {
            family: handle.collection("family")?,
            devices: handle.collection("devices")?,
            members: handle.collection("members")?,
            permissions: handle.collection("permissions")?,
            invitations: handle.collection("invitations")?,
            calendars: handle.collection("calendars")?,
            events: handle.collection("events")?,
            task_lists: handle.collection("taskLists")?,
            tasks: handle.collection("tasks")?,
            email_labels: handle.collection("emailLabels")?,
        })
    }
}
