//! Core domain model types for asrflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage kinds and calculation directory status
//! - Artifact records
//! - Parameter domains and validated parameter sets

mod artifact;
mod params;
mod status;

pub use artifact::{ArtifactRecord, ArtifactSet};
pub use params::{ParamDomain, ParamSpec, Params, ResolvedParams, SUPPORTED_MODEL_MATRICES};
pub use status::{CalcStatus, ParseStageKindError, StageKind};
