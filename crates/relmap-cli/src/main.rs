//! Relmap CLI
//!
//! Command-line interface for the relmap demo: fetch-strategy comparison,
//! plan explanation and seed import

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relmap_core::logging_facility;
use relmap_store::RelmapConfig;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "relmap")]
#[command(about = "relmap - object-relational mapping demo", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "relmap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the library with one or every fetch strategy and count queries
    Demo(commands::demo::DemoArgs),
    /// Print the fetch plan of a strategy without touching a database
    Explain(commands::explain::ExplainArgs),
    /// Seed import operations
    Seed(commands::seed::SeedArgs),
}

fn main() {
    let cli = Cli::parse();

    let config = match RelmapConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    logging_facility::init_with_filter(config.logging.profile, config.logging.filter.as_deref());

    let result = match cli.command {
        Commands::Demo(args) => commands::demo::execute(args, &config),
        Commands::Explain(args) => commands::explain::execute(args, &config),
        Commands::Seed(args) => commands::seed::execute(args, &config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
