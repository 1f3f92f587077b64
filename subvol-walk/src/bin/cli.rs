// SPDX-License-Identifier: GPL-3.0-only

//! CLI wrapper around the subvol-walk library for manual inspection

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use subvol_walk::{SubvolumeEntry, SubvolumeInspector, SubvolumeIter, WalkOptions};

/// Enumerate and inspect Btrfs subvolumes
#[derive(Parser)]
#[command(name = "subvol-walk-cli")]
#[command(about = "CLI tool for Btrfs subvolume enumeration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the subvolumes below a subvolume
    List {
        /// Directory to start from
        path: PathBuf,
        /// Subvolume to list below, defaults to the one `path` is the root of
        #[arg(long, default_value_t = 0)]
        top: u64,
        /// List children before their parents
        #[arg(long)]
        post_order: bool,
        /// Include subvolume metadata
        #[arg(long)]
        info: bool,
    },
    /// Show metadata of a subvolume
    Info {
        /// Directory on the filesystem
        path: PathBuf,
        /// Subvolume id, 0 for the subvolume `path` is the root of
        #[arg(long, default_value_t = 0)]
        id: u64,
    },
    /// Show the path of a subvolume relative to the top-level subvolume
    Path {
        /// Directory on the filesystem
        path: PathBuf,
        /// Subvolume id, 0 for the subvolume containing `path`
        #[arg(long, default_value_t = 0)]
        id: u64,
    },
    /// Show the id of the subvolume containing a directory
    Id {
        /// Directory on the filesystem
        path: PathBuf,
    },
    /// Check whether a directory is the root of a subvolume
    IsSubvolume {
        /// Directory to check
        path: PathBuf,
    },
    /// List subvolumes deleted but not yet cleaned up
    Deleted {
        /// Directory on the filesystem
        path: PathBuf,
    },
    /// Show the default subvolume of the filesystem
    Default {
        /// Directory on the filesystem
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize tracing to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List {
            path,
            top,
            post_order,
            info,
        } => {
            let options = WalkOptions::new()
                .top(top)
                .post_order(post_order)
                .with_info(info);
            let mut iter = SubvolumeIter::new(path, options)?;
            let mut entries: Vec<SubvolumeEntry> = Vec::new();
            while let Some(entry) = iter.advance()? {
                entries.push(entry);
            }

            let json = serde_json::to_string(&entries)?;
            println!("{}", json);
        }
        Commands::Info { path, id } => {
            let inspector = SubvolumeInspector::new(path)?;
            let info = inspector.subvolume_info(id)?;
            let json = serde_json::to_string(&info)?;
            println!("{}", json);
        }
        Commands::Path { path, id } => {
            let inspector = SubvolumeInspector::new(path)?;
            let subvol_path = inspector.subvolume_path(id)?;
            println!("{}", serde_json::json!({ "path": subvol_path }));
        }
        Commands::Id { path } => {
            let inspector = SubvolumeInspector::new(path)?;
            let id = inspector.subvolume_id()?;
            println!("{}", serde_json::json!({ "id": id }));
        }
        Commands::IsSubvolume { path } => {
            let inspector = SubvolumeInspector::new(path)?;
            let is_subvolume = inspector.is_subvolume()?;
            println!("{}", serde_json::json!({ "is_subvolume": is_subvolume }));
        }
        Commands::Deleted { path } => {
            let inspector = SubvolumeInspector::new(path)?;
            let ids = inspector.deleted_subvolumes()?;
            println!("{}", serde_json::json!({ "deleted": ids }));
        }
        Commands::Default { path } => {
            let inspector = SubvolumeInspector::new(path)?;
            let id = inspector.default_subvolume()?;
            println!("{}", serde_json::json!({ "default": id }));
        }
    }

    Ok(())
}
