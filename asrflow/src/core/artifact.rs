//! Artifact records kept in calculation manifests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Artifact locations reported by an engine, keyed by artifact name.
///
/// Relative paths are interpreted against the stage's output directory.
pub type ArtifactSet = BTreeMap<String, PathBuf>;

/// A validated artifact frozen into a complete calculation directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Location relative to the store root, or absolute when outside it.
    pub location: PathBuf,
    /// Size in bytes (summed over entries for directories).
    pub size_bytes: u64,
    /// Hex SHA-256 digest of file artifacts; `None` for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// When the artifact was recorded (ISO 8601).
    pub recorded_at: String,
}

impl ArtifactRecord {
    /// Creates a new artifact record stamped with the current time.
    #[must_use]
    pub fn new(location: impl Into<PathBuf>, size_bytes: u64, sha256: Option<String>) -> Self {
        Self {
            location: location.into(),
            size_bytes,
            sha256,
            recorded_at: crate::utils::iso_timestamp(),
        }
    }

    /// Returns true if the artifact is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.sha256.is_none()
    }
}
