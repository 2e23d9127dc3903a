//! Force the document open after a crash.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::Config;
use sync_doc::{DeviceIdentity, DocumentReplicaManager};

use super::open_store;

/// Run the reset command.
pub async fn run(data_dir: &Path, config: &Config) -> Result<()> {
    let store = open_store(data_dir).await?;
    let identity = DeviceIdentity::load_or_create(store.as_ref(), &config.device.name)
        .await
        .context("Failed to load device identity")?;
    let manager = DocumentReplicaManager::new(identity.device_id, store.clone());

    manager
        .initialize_with_recovery()
        .await
        .context("Document could not be recovered")?;
    manager.close().await.context("Failed to close document")?;
    store.close().await;

    println!("Document reset. Start the daemon again with 'hearth-sync run'.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::LocalDevice;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reset_clears_a_stale_lock() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        crate::commands::create::run(dir.path(), &config, "Acme")
            .await
            .unwrap();

        // A process that died while holding the document.
        let store = open_store(dir.path()).await.unwrap();
        let identity = DeviceIdentity::load_or_create(store.as_ref(), "x")
            .await
            .unwrap();
        let crashed = Arc::new(DocumentReplicaManager::new(identity.device_id, store.clone()));
        crashed.initialize().await.unwrap();
        drop(crashed);
        store.close().await;

        assert!(LocalDevice::open(dir.path(), &config).await.is_err());

        run(dir.path(), &config).await.unwrap();

        let device = LocalDevice::open(dir.path(), &config).await.unwrap();
        assert_eq!(device.family.family().unwrap().unwrap().name, "Acme");
        device.close().await.unwrap();
    }
}
