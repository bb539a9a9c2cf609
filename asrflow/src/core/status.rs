//! Stage kind and calculation status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The kind of calculation a stage performs.
///
/// This is a closed set: each kind is served by exactly one engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Substitution model selection on the input alignment.
    ModelSelection,
    /// Maximum-likelihood gene tree inference.
    GeneTree,
    /// Ancestral state reconstruction on a gene or reconciled tree.
    Ancestors,
    /// Gene tree / species tree reconciliation.
    Reconcile,
    /// Bootstrap resampling of the gene tree.
    Bootstrap,
}

impl StageKind {
    /// Every stage kind, in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::ModelSelection,
        Self::GeneTree,
        Self::Ancestors,
        Self::Reconcile,
        Self::Bootstrap,
    ];

    /// Returns the snake_case name used in manifests and chain files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ModelSelection => "model_selection",
            Self::GeneTree => "gene_tree",
            Self::Ancestors => "ancestors",
            Self::Reconcile => "reconcile",
            Self::Bootstrap => "bootstrap",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage kind.
#[derive(Debug, Clone, Error)]
#[error("Unknown stage kind '{0}'")]
pub struct ParseStageKindError(pub String);

impl FromStr for StageKind {
    type Err = ParseStageKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ParseStageKindError(s.to_string()))
    }
}

/// The persisted status of a calculation directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcStatus {
    /// No directory exists under this name.
    Absent,
    /// A stage has begun writing the directory.
    InProgress,
    /// Every declared artifact is present.
    Complete,
    /// The engine failed or the artifact set was incomplete.
    Failed,
}

impl Default for CalcStatus {
    fn default() -> Self {
        Self::Absent
    }
}

impl fmt::Display for CalcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl CalcStatus {
    /// Returns true if the status is final for a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if a directory in this status may be consumed as a predecessor.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::ModelSelection.to_string(), "model_selection");
        assert_eq!(StageKind::GeneTree.to_string(), "gene_tree");
        assert_eq!(StageKind::Bootstrap.to_string(), "bootstrap");
    }

    #[test]
    fn test_stage_kind_parse_accepts_dashes() {
        assert_eq!("gene-tree".parse::<StageKind>().unwrap(), StageKind::GeneTree);
        assert_eq!(" Reconcile ".parse::<StageKind>().unwrap(), StageKind::Reconcile);
        assert!("ml_tree".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_calc_status_usable() {
        assert!(CalcStatus::Complete.is_usable());
        assert!(!CalcStatus::Failed.is_usable());
        assert!(!CalcStatus::InProgress.is_usable());
        assert!(CalcStatus::Failed.is_terminal());
        assert!(!CalcStatus::Absent.is_terminal());
    }

    #[test]
    fn test_calc_status_serialize() {
        let json = serde_json::to_string(&CalcStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);

        let kind: StageKind = serde_json::from_str(r#""model_selection""#).unwrap();
        assert_eq!(kind, StageKind::ModelSelection);
    }
}
