//! # Asrflow
//!
//! Calculation-stage pipeline for ancestral sequence reconstruction.
//!
//! Each stage (model selection, gene tree inference, ancestor reconstruction,
//! reconciliation, bootstrap) runs inside its own calculation directory.
//! Directories are linked into lineages through their predecessor, carry a
//! manifest with status and artifacts, and are never modified once complete
//! except by an explicit overwrite.
//!
//! - **Stage catalog**: descriptors with parameter domains and output schemas
//! - **Calculation store**: exclusive directory lifecycle with stale detection
//! - **Stage runner**: parameter validation, predecessor checks, engine dispatch
//! - **Orchestrator**: ordered chains with read pins on consumed directories
//! - **Report**: a static HTML bundle over a finished tree and ancestors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use asrflow::prelude::*;
//!
//! let store = Arc::new(CalcStore::open("calculations")?);
//! let runner = StageRunner::new(store, config.engine_set()?);
//! let chain = PipelineChain::new()
//!     .stage(StageInvocation::new(StageKind::ModelSelection, "00_find-model")
//!         .with_param("alignment", json!("family.fasta")))
//!     .stage(StageInvocation::new(StageKind::GeneTree, "01_gene-tree").after("00_find-model"));
//!
//! let result = Orchestrator::new(runner).execute(&chain).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod engines;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stages;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{CommandSpec, PipelineConfig};
    pub use crate::core::{ArtifactRecord, ArtifactSet, CalcStatus, Params, ResolvedParams, StageKind};
    pub use crate::engines::{CommandEngine, Engine, EngineRequest, EngineSet, FnEngine};
    pub use crate::errors::{EngineFailure, PipelineError, PipelineResult};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{ChainExecutionResult, Orchestrator, PipelineChain};
    pub use crate::report::{build_report, ReportBundle};
    pub use crate::runner::StageRunner;
    pub use crate::stages::{StageCatalog, StageDescriptor, StageInvocation, StageVariant};
    pub use crate::store::{CalcDirectory, CalcStore};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
