//! Explain command
//!
//! Usage: relmap explain <STRATEGY> [--authors N] [--books N]

use clap::Args;
use relmap_core::FetchPlanner;
use relmap_store::demo::{self, Strategy};
use relmap_store::RelmapConfig;

#[derive(Debug, Args)]
pub struct ExplainArgs {
    /// lazy, batched, join, graph or eager
    pub strategy: Strategy,

    /// Authors assumed for the statement estimate
    #[arg(long, default_value_t = 25)]
    pub authors: usize,

    /// Books per author assumed for the statement estimate
    #[arg(long, default_value_t = 4)]
    pub books: usize,
}

/// Execute explain command
pub fn execute(args: ExplainArgs, config: &RelmapConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = demo::registry(args.strategy)?;
    let query = args.strategy.query();
    let planner = FetchPlanner::new(&registry, &config.session);
    let plan = planner.plan(query.entity_type(), query.fetch_request())?;

    print!("{}", plan.explain());
    if plan.is_empty() {
        println!("  (nothing fetched up front; books load on first access)");
        return Ok(());
    }
    println!(
        "estimated statements: {} for {} authors with {} books each",
        plan.estimated_statements(args.authors, args.books),
        args.authors,
        args.books
    );
    Ok(())
}
