//! Run engine for squadron.
//!
//! Turns a plan into finished work:
//! - execution modes deciding isolation and parallelism
//! - the coordinator loop owning every task transition
//! - per-run wiring and session reports

pub mod coordinator;
pub mod engine;
pub mod modes;
pub mod report;

pub use coordinator::{Coordinator, CoordinatorError, RunOutcome, RunReport};
pub use engine::{Engine, EngineError};
