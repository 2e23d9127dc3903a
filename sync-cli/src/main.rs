//! # hearth-sync
//!
//! Sync daemon and command-line tool for Hearth families.
//!
//! ## Commands
//!
//! - `run`: Run the sync daemon until interrupted
//! - `create-family`: Create a family with this device as admin
//! - `join`: Find a family on the local network and ask to join it
//! - `status`: Show device, family and document status
//! - `reset`: Force the document open after a crash
//!
//! ## Example
//!
//! ```bash
//! # On the first device
//! hearth-sync create-family "Acme"
//! hearth-sync run --auto-approve member
//!
//! # On another device on the same network
//! hearth-sync join "Acme"
//! hearth-sync run
//! ```
//!
//! Log output is controlled with `RUST_LOG` (default: `info`).

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use sync_types::Role;

mod commands;
mod config;

use commands::{create, join, reset, run, status};

/// Hearth family sync daemon.
#[derive(Parser, Debug)]
#[command(name = "hearth-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ./hearth.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the device store (overrides the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon until interrupted
    Run {
        /// Approve every join request with this role
        #[arg(long, value_enum)]
        auto_approve: Option<RoleArg>,
    },

    /// Create a family with this device as admin
    CreateFamily {
        /// Family name
        name: String,
    },

    /// Find a family on the local network and ask to join it
    Join {
        /// Family name or id
        family: String,

        /// Seconds to wait for discovery, approval and the first sync
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// Show device, family and document status
    Status,

    /// Force the document open after a crash (discards unflushed changes)
    Reset,
}

/// Role granted to approved devices.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoleArg {
    Admin,
    Member,
    Child,
    Viewer,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => Role::Admin,
            RoleArg::Member => Role::Member,
            RoleArg::Child => Role::Child,
            RoleArg::Viewer => Role::Viewer,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::load(cli.config.as_deref())?;
    let data_dir = config::data_dir(cli.data_dir, &config)?;

    match cli.command {
        Commands::Run { auto_approve } => {
            run::run(&data_dir, config, auto_approve.map(Role::from)).await?;
        }
        Commands::CreateFamily { name } => {
            create::run(&data_dir, &config, &name).await?;
        }
        Commands::Join { family, timeout } => {
            join::run(&data_dir, config, &family, Duration::from_secs(timeout)).await?;
        }
        Commands::Status => {
            status::run(&data_dir, &config).await?;
        }
        Commands::Reset => {
            reset::run(&data_dir, &config).await?;
        }
    }

    Ok(())
}
