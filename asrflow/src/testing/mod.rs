//! Testing utilities for asrflow pipelines.
//!
//! This module provides stand-in engines that write plausible artifacts
//! into the output directory, so chains can run end to end without any
//! phylogenetics software installed.

mod engines;

pub use engines::{ArtifactWritingEngine, FailingEngine};
