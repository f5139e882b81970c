mod config;
mod inspect;
mod upload;

use anyhow::Result;
use clap::{Args, Subcommand};
use ovirtkit_core::Config;
use std::path::PathBuf;

use crate::output::OutputFormat;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a raw or qcow2 image
    Upload {
        /// Path to the image file
        file: PathBuf,

        /// Storage domain for the new disk
        #[arg(long, required_unless_present = "disk_id")]
        storage_domain: Option<String>,

        /// Upload into this existing disk instead of creating one
        #[arg(long, conflicts_with_all = ["storage_domain", "alias"])]
        disk_id: Option<String>,

        /// Alias of the new disk (defaults to the file name)
        #[arg(long)]
        alias: Option<String>,

        /// Thin-provision the new disk (overrides upload.sparse)
        #[arg(long, overrides_with = "no_sparse")]
        sparse: bool,

        /// Preallocate the new disk (overrides upload.sparse)
        #[arg(long, overrides_with = "sparse")]
        no_sparse: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Show the format and virtual size of an image
    Inspect {
        /// Path to the image file
        file: PathBuf,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Connection settings; each overrides the configuration file.
#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Engine URL, e.g. https://engine.example.com
    #[arg(long, env = "OVIRT_URL")]
    pub url: Option<String>,

    #[arg(long, env = "OVIRT_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "OVIRT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Extra CA certificate (PEM) to trust
    #[arg(long, env = "OVIRT_CA_FILE")]
    pub ca_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file location
    Path,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn execute(command: Command, config: Config, format: OutputFormat) -> Result<()> {
    match command {
        Command::Upload {
            file,
            storage_domain,
            disk_id,
            alias,
            sparse,
            no_sparse,
            engine,
        } => {
            let target = match disk_id {
                Some(disk_id) => upload::Target::Existing(disk_id),
                None => upload::Target::NewDisk {
                    storage_domain: storage_domain.unwrap_or_default(),
                    alias,
                    sparse: sparse_override(sparse, no_sparse),
                },
            };
            upload::execute(file, target, engine, config, format).await
        }
        Command::Inspect { file } => inspect::execute(file, format).await,
        Command::Config { action } => config::execute(action, config, format).await,
    }
}

/// `None` leaves the configured `upload.sparse` in effect.
fn sparse_override(sparse: bool, no_sparse: bool) -> Option<bool> {
    match (sparse, no_sparse) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}
