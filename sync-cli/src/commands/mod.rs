//! CLI command implementations.

pub mod create;
pub mod join;
pub mod reset;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use sync_client::{Config, EngineError, SyncEngine, TcpConnector, UdpAdvertiser};
use sync_doc::{
    DeviceIdentity, DocumentError, DocumentReplicaManager, FamilyService, PersistenceError,
    RandomTokens, SqliteStore,
};

/// SQLite database inside the data directory.
pub const STORE_FILE: &str = "hearth.db";

/// Open (or create) the device store.
pub async fn open_store(data_dir: &Path) -> Result<Arc<SqliteStore>> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .context("Failed to create data directory")?;
    let store = SqliteStore::new(&data_dir.join(STORE_FILE))
        .await
        .context("Failed to open device store")?;
    Ok(Arc::new(store))
}

/// Turn a held document lock into an actionable message.
pub fn explain_lock(err: DocumentError) -> anyhow::Error {
    match err {
        DocumentError::Persistence(PersistenceError::Locked { holder, .. }) => anyhow::anyhow!(
            "Document is in use by {holder}. Stop the running daemon, or run \
             'hearth-sync reset' if it crashed."
        ),
        other => anyhow::Error::new(other).context("Failed to open document"),
    }
}

/// Open the store and a full sync engine over TCP and UDP discovery.
///
/// The engine is not started.
pub async fn open_engine(
    data_dir: &Path,
    config: Config,
) -> Result<(Arc<SqliteStore>, SyncEngine)> {
    let store = open_store(data_dir).await?;
    let advertiser = UdpAdvertiser::bind(config.discovery.port)
        .await
        .context("Failed to bind discovery port")?;
    let engine = SyncEngine::open(
        config,
        store.clone(),
        Arc::new(TcpConnector::new()),
        Arc::new(advertiser),
    )
    .await
    .map_err(|e| match e {
        EngineError::Document(e) => explain_lock(e),
        other => anyhow::Error::new(other).context("Failed to open sync engine"),
    })?;
    Ok((store, engine))
}

/// Device identity, document and family service for one-shot commands.
pub struct LocalDevice {
    /// Persisted identity.
    pub identity: DeviceIdentity,
    /// The loaded document.
    pub manager: Arc<DocumentReplicaManager>,
    /// Family management.
    pub family: FamilyService,
    store: Arc<SqliteStore>,
}

impl LocalDevice {
    /// Open the store and load the document.
    pub async fn open(data_dir: &Path, config: &Config) -> Result<Self> {
        let store = open_store(data_dir).await?;
        let identity = DeviceIdentity::load_or_create(store.as_ref(), &config.device.name)
            .await
            .context("Failed to load device identity")?;
        let manager = Arc::new(DocumentReplicaManager::new(
            identity.device_id,
            store.clone(),
        ));
        manager.initialize().await.map_err(explain_lock)?;
        let family = FamilyService::new(
            manager.clone(),
            store.clone(),
            Arc::new(RandomTokens),
            identity.device_name.clone(),
        );
        Ok(Self {
            identity,
            manager,
            family,
            store,
        })
    }

    /// Flush and release the document, then close the store.
    pub async fn close(self) -> Result<()> {
        self.manager
            .close()
            .await
            .context("Failed to close document")?;
        self.store.close().await;
        Ok(())
    }
}
