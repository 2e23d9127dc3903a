//! Find a family on the local network and join it.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use sync_client::{Config, SyncEngine};
use sync_types::DiscoveredFamily;
use tokio::time::Instant;

use super::open_engine;

const DISCOVERY_POLL: Duration = Duration::from_millis(250);

/// Run the join command.
pub async fn run(data_dir: &Path, config: Config, family: &str, timeout: Duration) -> Result<()> {
    let (store, engine) = open_engine(data_dir, config).await?;
    engine.start();

    let result = join(&engine, family, timeout).await;
    engine.shutdown().await;
    store.close().await;
    result
}

async fn join(engine: &SyncEngine, wanted: &str, timeout: Duration) -> Result<()> {
    println!("Looking for family \"{wanted}\" on the local network...");
    let deadline = Instant::now() + timeout;
    let family = loop {
        let found = engine.discovery().get_discovered_families();
        if let Some(family) = pick_family(&found, wanted) {
            break family;
        }
        if Instant::now() >= deadline {
            bail!("No family \"{wanted}\" found. Is its admin device running?");
        }
        tokio::time::sleep(DISCOVERY_POLL).await;
    };

    println!("Found {} ({}). Asking its admin to let us in...", family.name, family.family_id);
    let remaining = deadline.saturating_duration_since(Instant::now());
    let state = engine
        .join_family(family.family_id, remaining)
        .await
        .context("Join failed")?;

    println!();
    println!("Joined family {}!", state.family.name);
    if let Some(role) = state.role_of(&state.current_device_id) {
        println!("  Role:    {role}");
    }
    println!("  Devices: {}", state.devices.len());
    println!();
    println!("Start syncing: hearth-sync run");
    Ok(())
}

/// The advertised family matching `wanted` by id, else by name.
fn pick_family(found: &[DiscoveredFamily], wanted: &str) -> Option<DiscoveredFamily> {
    found
        .iter()
        .find(|f| f.family_id.to_string() == wanted)
        .or_else(|| found.iter().find(|f| f.name == wanted))
        .cloned()
}
