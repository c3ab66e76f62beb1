//! Fetch planning and execution

mod loader;
pub mod plan;

pub use plan::{FetchNode, FetchPlan, FetchPlanner, FetchRequest, PlannedFetch};
