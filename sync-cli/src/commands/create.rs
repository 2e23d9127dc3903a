//! Create a family.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::Config;

use super::LocalDevice;

/// Run the create-family command.
pub async fn run(data_dir: &Path, config: &Config, name: &str) -> Result<()> {
    let device = LocalDevice::open(data_dir, config).await?;
    let created = device.family.create_family(name).await;
    device.close().await?;
    let family = created.context("Failed to create family")?;

    println!("Family created!");
    println!();
    println!("  Family ID: {}", family.id);
    println!("  Name:      {}", family.name);
    println!("  Admin:     {}", family.created_by);
    println!();
    println!("Next steps:");
    println!("  1. Start syncing: hearth-sync run --auto-approve member");
    println!("  2. On another device: hearth-sync join \"{}\"", family.name);

    Ok(())
}
