//! Pipeline chains and their execution.
//!
//! This module provides:
//! - Chain declaration and shape validation
//! - The sequential orchestrator

mod chain;
mod orchestrator;

pub use chain::PipelineChain;
pub use orchestrator::{ChainExecutionResult, Orchestrator};
