//! Multi-device scenarios.
//!
//! - `join` - Family setup and the admin-approved join handshake
//! - `sync` - Convergence, concurrent writes, offline edits
//! - `links` - Link failure on one peer, degraded status, eviction

mod join;
mod links;
mod sync;

use serde_json::json;
use sync_client::SyncEngine;

/// Write a task on `device`.
fn write_task(device: &SyncEngine, key: &str, title: &str) {
    device
        .manager()
        .get_structure()
        .unwrap()
        .tasks
        .set(key, &json!({ "title": title }))
        .unwrap();
}

/// Whether `device` holds task `key`.
fn has_task(device: &SyncEngine, key: &str) -> bool {
    device
        .manager()
        .get_structure()
        .ok()
        .and_then(|doc| doc.tasks.get(key).ok().flatten())
        .is_some()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
