//! Persisted manifest and the read-only directory view.

use crate::core::{ArtifactRecord, CalcStatus, ResolvedParams, StageKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identity of the predecessor a run consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredecessorRef {
    /// Predecessor calculation directory name.
    pub name: String,
    /// Kind of the predecessor stage.
    pub kind: StageKind,
    /// Run id of the predecessor at the time it was consumed.
    pub run_id: Uuid,
    /// When the predecessor completed.
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Contents of `calc.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalcManifest {
    /// Calculation directory name.
    pub name: String,
    /// Stage kind that wrote the directory.
    pub kind: StageKind,
    /// Variant tag (e.g. `reconcile_bootstrap`).
    pub variant: String,
    /// Lifecycle status.
    pub status: CalcStatus,
    /// Unique id of this run.
    pub run_id: Uuid,
    /// The predecessor consumed, if any.
    #[serde(default)]
    pub inputs_used: Option<PredecessorRef>,
    /// Ancestor directory names, oldest first.
    #[serde(default)]
    pub lineage: Vec<String>,
    /// Validated parameters the stage ran with.
    #[serde(default)]
    pub params: ResolvedParams,
    /// Artifacts the run had to produce.
    #[serde(default)]
    pub output_schema: BTreeSet<String>,
    /// Artifact view carried from the lineage and input overrides.
    #[serde(default)]
    pub inherited: BTreeMap<String, PathBuf>,
    /// Artifacts produced by this run; only populated once complete.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    /// When the run began.
    pub started_at: String,
    /// When the run reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<String>,
    /// Failure cause when failed.
    #[serde(default)]
    pub failure: Option<String>,
}

/// A calculation directory as seen through its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct CalcDirectory {
    root: PathBuf,
    path: PathBuf,
    manifest: CalcManifest,
}

impl CalcDirectory {
    pub(crate) fn new(root: &Path, manifest: CalcManifest) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(&manifest.name),
            manifest,
        }
    }

    /// Returns the directory name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Returns the absolute directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stage kind that wrote the directory.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.manifest.kind
    }

    /// Returns the variant tag.
    #[must_use]
    pub fn variant(&self) -> &str {
        &self.manifest.variant
    }

    /// Returns the persisted status.
    #[must_use]
    pub fn status(&self) -> CalcStatus {
        self.manifest.status
    }

    /// Returns true if the directory is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.manifest.status == CalcStatus::Complete
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.manifest.run_id
    }

    /// Returns the raw manifest.
    #[must_use]
    pub fn manifest(&self) -> &CalcManifest {
        &self.manifest
    }

    /// Returns the ancestor names, oldest first.
    #[must_use]
    pub fn lineage(&self) -> &[String] {
        &self.manifest.lineage
    }

    /// Returns true if `name` is this directory or one of its ancestors.
    #[must_use]
    pub fn descends_from(&self, name: &str) -> bool {
        self.name() == name || self.manifest.lineage.iter().any(|n| n == name)
    }

    /// Returns the absolute path of one of this run's own artifacts.
    #[must_use]
    pub fn artifact_path(&self, name: &str) -> Option<PathBuf> {
        self.manifest
            .artifacts
            .get(name)
            .map(|record| self.root.join(&record.location))
    }

    /// Returns the artifact view a successor sees, as store-relative locations.
    ///
    /// Inherited artifacts are overlaid by this run's own, so the nearest
    /// producer in the lineage wins.
    #[must_use]
    pub fn resolved_locations(&self) -> BTreeMap<String, PathBuf> {
        let mut view = self.manifest.inherited.clone();
        for (name, record) in &self.manifest.artifacts {
            view.insert(name.clone(), record.location.clone());
        }
        view
    }

    /// Returns the artifact view a successor sees, as absolute paths.
    #[must_use]
    pub fn resolved_artifacts(&self) -> BTreeMap<String, PathBuf> {
        self.resolved_locations()
            .into_iter()
            .map(|(name, location)| (name, self.root.join(location)))
            .collect()
    }

    /// Builds the reference a successor records in `inputs_used`.
    #[must_use]
    pub fn to_predecessor_ref(&self) -> PredecessorRef {
        PredecessorRef {
            name: self.name().to_string(),
            kind: self.kind(),
            run_id: self.run_id(),
            completed_at: self.manifest.finished_at.clone(),
        }
    }
}
