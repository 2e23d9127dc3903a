//! Show device, family and document status.

use anyhow::{Context, Result};
use std::path::Path;
use sync_client::Config;
use sync_doc::COLLECTIONS;
use sync_types::Timestamp;

use super::LocalDevice;

/// Run the status command.
pub async fn run(data_dir: &Path, config: &Config) -> Result<()> {
    let device = LocalDevice::open(data_dir, config).await?;
    let result = print_status(&device, data_dir);
    device.close().await?;
    result
}

fn print_status(device: &LocalDevice, data_dir: &Path) -> Result<()> {
    println!("=== hearth-sync status ===");
    println!();
    println!("Device:");
    println!("  ID:       {}", device.identity.device_id);
    println!("  Name:     {}", device.identity.device_name);
    println!("  Data dir: {}", data_dir.display());
    println!();

    let Some(state) = device
        .family
        .get_family_state()
        .context("Failed to read family")?
    else {
        match device.identity.family_id {
            Some(id) => println!("Family: {id} (waiting for first sync)"),
            None => {
                println!("Family: NONE");
                println!();
                println!("Run 'hearth-sync create-family <name>' or 'hearth-sync join <family>'.");
            }
        }
        return Ok(());
    };

    println!("Family:");
    println!("  ID:      {}", state.family.id);
    println!("  Name:    {}", state.family.name);
    println!("  Created: {}", format_timestamp(state.family.created_at));
    match state.role_of(&state.current_device_id) {
        Some(role) => println!("  Role:    {role}"),
        None => println!("  Role:    (not registered)"),
    }
    println!();
    println!("Devices ({}):", state.devices.len());
    for d in &state.devices {
        let marker = if d.is_current { " (this device)" } else { "" };
        println!(
            "  {} {}{} - last seen {}",
            d.id,
            d.name,
            marker,
            format_timestamp(d.last_seen)
        );
    }
    println!();

    println!("Collections:");
    for name in COLLECTIONS {
        let entries = device.manager.get_map(name)?.len()?;
        println!("  {name:<12} {entries}");
    }

    Ok(())
}

/// Format milliseconds since the epoch as a relative age.
fn format_timestamp(ms: Timestamp) -> String {
    let now = sync_types::now_millis();
    if ms == 0 {
        return "never".to_string();
    }
    let secs = now.saturating_sub(ms) / 1000;
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_works_without_family() {
        let dir = tempdir().unwrap();
        run(dir.path(), &Config::default()).await.unwrap();
    }

    #[tokio::test]
    async fn status_works_with_family() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        crate::commands::create::run(dir.path(), &config, "Acme")
            .await
            .unwrap();
        run(dir.path(), &config).await.unwrap();
    }

    #[test]
    fn timestamps_render_as_age() {
        let now = sync_types::now_millis();
        assert_eq!(format_timestamp(0), "never");
        assert_eq!(format_timestamp(now), "0s ago");
        assert_eq!(format_timestamp(now - 120_000), "2m ago");
        assert_eq!(format_timestamp(now - 3 * 86_400_000), "3d ago");
    }
}
