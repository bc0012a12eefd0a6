//! Reallocation strategy.
//!
//! Contains the core logic for:
//! - Yield comparison and go/no-go decisions
//! - Swap planning, router whitelisting and transaction submission
//! - Sequential batch execution across all active positions

mod decision;
mod executor;

pub use decision::{Decision, DecisionEngine};
pub use executor::{
    BatchSummary, ExecutionError, ExecutionOutcome, ExecutionStatus, ReallocationExecutor,
    ReallocationPlan,
};
