//! Seed import command
//!
//! Usage: relmap seed import <PATH> [--db <FILE>]

use std::path::PathBuf;

use clap::{Args, Subcommand};
use relmap_store::demo::{self, Strategy};
use relmap_store::seed::import_seed_file;
use relmap_store::{RelmapConfig, SqliteStore, StoreConfig};

#[derive(Debug, Args)]
pub struct SeedArgs {
    #[command(subcommand)]
    pub command: SeedCommand,
}

#[derive(Debug, Subcommand)]
pub enum SeedCommand {
    /// Import a seed file into the database
    Import(ImportArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Path to seed YAML file or directory
    pub path: PathBuf,

    /// Database file (overrides `[store] path`)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

/// Execute seed command
pub fn execute(args: SeedArgs, config: &RelmapConfig) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        SeedCommand::Import(import_args) => execute_import(import_args, config),
    }
}

/// Execute seed import
fn execute_import(args: ImportArgs, config: &RelmapConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store_config = StoreConfig {
        path: args.db.clone().or_else(|| config.store.path.clone()),
        ..config.store.clone()
    };
    if store_config.path.is_none() {
        tracing::warn!("no database path configured; importing into a throwaway in-memory database");
    }
    let mut store = SqliteStore::open(&store_config)?;
    demo::install_schema(store.connection())?;
    let registry = demo::registry(Strategy::Lazy)?;

    let seed_files = if args.path.is_dir() {
        // Sorted for determinism
        let mut files: Vec<PathBuf> = std::fs::read_dir(&args.path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    } else {
        vec![args.path]
    };

    for seed_file in seed_files {
        println!("Importing {}...", seed_file.display());
        let report = import_seed_file(&seed_file, &registry, &mut store, &config.session)?;
        println!(
            "✓ Imported {} entities, {} references, {} links ({} statements)",
            report.entities, report.references, report.links, report.statements
        );
    }

    Ok(())
}
