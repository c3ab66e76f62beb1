//! Demo command
//!
//! Usage: relmap demo [STRATEGY] [--authors N] [--books N] [--json]
//!
//! Every run uses a fresh in-memory database; `[store]` settings other than
//! the path still apply.

use clap::Args;
use relmap_store::demo::{self, DemoReport, Strategy};
use relmap_store::{RelmapConfig, SqliteStore, StoreConfig};

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// lazy, batched, join, graph or eager (default: all of them)
    pub strategy: Option<Strategy>,

    /// Number of authors
    #[arg(long, default_value_t = 25)]
    pub authors: usize,

    /// Books per author
    #[arg(long, default_value_t = 4)]
    pub books: usize,

    /// Print the shelves of each run
    #[arg(long)]
    pub verbose: bool,

    /// Print one JSON summary per strategy instead of text
    #[arg(long)]
    pub json: bool,
}

/// Execute demo command
pub fn execute(args: DemoArgs, config: &RelmapConfig) -> Result<(), Box<dyn std::error::Error>> {
    let strategies = match args.strategy {
        Some(strategy) => vec![strategy],
        None => Strategy::ALL.to_vec(),
    };

    for strategy in strategies {
        let report = run_one(strategy, &args, config)?;
        if args.json {
            let summary = serde_json::json!({
                "strategy": strategy.to_string(),
                "authors": report.shelves.len(),
                "books": report.shelves.iter().map(|s| s.titles.len()).sum::<usize>(),
                "statistics": report.statistics,
            });
            println!("{}", summary);
            continue;
        }
        print_report(&report, args.verbose);
    }

    Ok(())
}

fn run_one(
    strategy: Strategy,
    args: &DemoArgs,
    config: &RelmapConfig,
) -> Result<DemoReport, Box<dyn std::error::Error>> {
    let store_config = StoreConfig {
        path: None,
        ..config.store.clone()
    };
    let mut store = SqliteStore::open(&store_config)?;
    demo::install_schema(store.connection())?;
    Ok(demo::run(&mut store, strategy, args.authors, args.books, &config.session)?)
}

fn print_report(report: &DemoReport, verbose: bool) {
    let books: usize = report.shelves.iter().map(|s| s.titles.len()).sum();
    println!(
        "{:<8} {} authors, {} books: {} queries",
        report.strategy,
        report.shelves.len(),
        books,
        report.statistics.queries_executed
    );
    if verbose {
        for shelf in &report.shelves {
            println!("  {}: {}", shelf.author, shelf.titles.join(", "));
        }
    }
}
