//! Exclusive ownership of an in-progress calculation directory.

use super::{CalcManifest, INPUT_DIR, MANIFEST_FILE, OUTPUT_DIR};
use crate::utils::fs::write_json_atomic;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Handle returned by [`CalcStore::begin`](super::CalcStore::begin).
///
/// While a handle is alive its directory is claimed by this process. Passing
/// it to `commit` or `abort` finalises the run. Dropping it without doing
/// either (e.g. the caller's future was cancelled) releases the claim but
/// leaves the directory in progress, so the store later reports it stale.
#[derive(Debug)]
pub struct CalcHandle {
    pub(super) root: PathBuf,
    pub(super) path: PathBuf,
    pub(super) manifest: CalcManifest,
    owners: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl CalcHandle {
    pub(super) fn new(root: &Path, manifest: CalcManifest, owners: Arc<Mutex<HashSet<String>>>) -> Self {
        Self {
            root: root.to_path_buf(),
            path: root.join(&manifest.name),
            manifest,
            owners,
            released: false,
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

    /// Directory for copied input overrides.
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.path.join(INPUT_DIR)
    }

    /// Directory the engine writes into.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.path.join(OUTPUT_DIR)
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.manifest.run_id
    }

    /// Returns the variant tag.
    #[must_use]
    pub fn variant(&self) -> &str {
        &self.manifest.variant
    }

    /// Returns the artifacts this run must produce.
    #[must_use]
    pub fn output_schema(&self) -> &BTreeSet<String> {
        &self.manifest.output_schema
    }

    /// Returns the inherited artifact view as absolute paths.
    #[must_use]
    pub fn inputs(&self) -> BTreeMap<String, PathBuf> {
        self.manifest
            .inherited
            .iter()
            .map(|(name, location)| (name.clone(), self.root.join(location)))
            .collect()
    }

    /// Records input overrides copied into this directory and persists the manifest.
    ///
    /// `copied` maps artifact names to absolute paths inside the directory.
    pub fn record_inputs(&mut self, copied: BTreeMap<String, PathBuf>) -> std::io::Result<()> {
        for (name, path) in copied {
            let location = path
                .strip_prefix(&self.root)
                .map_or_else(|_| path.clone(), Path::to_path_buf);
            self.manifest.inherited.insert(name, location);
        }
        self.persist()
    }

    pub(super) fn persist(&self) -> std::io::Result<()> {
        write_json_atomic(&self.path.join(MANIFEST_FILE), &self.manifest)
    }

    pub(super) fn release(&mut self) {
        if !self.released {
            self.owners.lock().remove(&self.manifest.name);
            self.released = true;
        }
    }
}

impl Drop for CalcHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                calc_dir = %self.manifest.name,
                run_id = %self.manifest.run_id,
                "Calculation handle dropped before commit; directory left in progress"
            );
            self.release();
        }
    }
}
