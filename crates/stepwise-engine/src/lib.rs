//! Plan execution for Stepwise.
//!
//! A plan is a list of tool steps. [`ExecutionEngine`] runs it either all at
//! once (parallel) or one step at a time, substituting `{{tool.field}}`
//! references with earlier outputs (chained), then aggregates the outcome.

pub mod aggregate;
pub mod engine;
pub mod error;
pub mod orderer;
pub mod resolver;

pub use aggregate::{aggregate, collect_errors};
pub use engine::{ExecutionEngine, RunPhase, RunRequest};
pub use error::EngineError;
pub use orderer::{checked_order, execution_order, find_cycle, sort_steps};
pub use resolver::{resolve_parameters, resolve_value, unresolved_references};
