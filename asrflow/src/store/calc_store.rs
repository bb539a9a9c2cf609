//! Filesystem-backed calculation directory store.

use super::{
    CalcDirectory, CalcHandle, CalcManifest, INPUT_DIR, LOCK_FILE, MANIFEST_FILE, OUTPUT_DIR,
};
use crate::core::{ArtifactRecord, ArtifactSet, CalcStatus, ResolvedParams, StageKind};
use crate::errors::{PipelineError, PipelineResult};
use crate::events::{names, EventSink, LoggingEventSink};
use crate::stages::StageVariant;
use crate::utils::fs::inspect_artifact;
use crate::utils::{generate_run_id, iso_timestamp, validate_calc_dir_name};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything `begin` needs to acquire a directory.
#[derive(Debug, Clone, Copy)]
pub struct BeginRequest<'a> {
    /// Directory name to acquire.
    pub name: &'a str,
    /// Stage kind that will write it.
    pub kind: StageKind,
    /// Variant whose schema the run must satisfy.
    pub variant: &'a StageVariant,
    /// Whether a complete predecessor is mandatory.
    pub requires_predecessor: bool,
    /// The predecessor directory, if any.
    pub predecessor: Option<&'a CalcDirectory>,
    /// Validated parameters, recorded in the manifest.
    pub params: &'a ResolvedParams,
    /// Whether a complete or stale directory may be replaced.
    pub overwrite: bool,
}

/// The authoritative store of calculation directories under one root.
#[derive(Debug)]
pub struct CalcStore {
    root: PathBuf,
    owners: Arc<Mutex<HashSet<String>>>,
    pins: Mutex<HashMap<String, usize>>,
    events: Arc<dyn EventSink>,
}

impl CalcStore {
    /// Opens (creating if needed) the store rooted at `root`.
    ///
    /// Directories left in progress by an earlier process are reported with
    /// a warning; they stay unusable until resumed or discarded.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root cannot be created or scanned.
    pub fn open(root: impl AsRef<Path>) -> PipelineResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .map_err(|e| PipelineError::io(format!("create store root {}", root.display()), e))?;
        let root = root
            .canonicalize()
            .map_err(|e| PipelineError::io(format!("resolve store root {}", root.display()), e))?;

        let store = Self {
            root,
            owners: Arc::new(Mutex::new(HashSet::new())),
            pins: Mutex::new(HashMap::new()),
            events: Arc::new(LoggingEventSink::default()),
        };

        for name in store.stale()? {
            warn!(calc_dir = %name, "Found stale in-progress calculation directory");
        }

        Ok(store)
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the event sink shared with runners built on this store.
    #[must_use]
    pub fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    fn dir_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
    }

    fn read_manifest(&self, dir: &Path) -> PipelineResult<Option<CalcManifest>> {
        let path = dir.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::io(format!("read {}", path.display()), e)),
        }
    }

    /// Looks up a directory by name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for malformed names and IO/serialization
    /// errors for unreadable manifests.
    pub fn lookup(&self, name: &str) -> PipelineResult<Option<CalcDirectory>> {
        validate_calc_dir_name(name)?;
        Ok(self
            .read_manifest(&self.dir_path(name))?
            .map(|manifest| CalcDirectory::new(&self.root, manifest)))
    }

    /// Returns every calculation directory under the root, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root cannot be read.
    pub fn list(&self) -> PipelineResult<Vec<CalcDirectory>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| PipelineError::io(format!("list {}", self.root.display()), e))?;

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io("list store entry", e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(manifest) = self.read_manifest(&entry.path())? {
                dirs.push(CalcDirectory::new(&self.root, manifest));
            }
        }
        dirs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(dirs)
    }

    /// Returns true if `dir` is in progress without a live owner in this process.
    #[must_use]
    pub fn is_stale(&self, dir: &CalcDirectory) -> bool {
        dir.status() == CalcStatus::InProgress && !self.owners.lock().contains(dir.name())
    }

    /// Returns the names of all stale directories.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root cannot be read.
    pub fn stale(&self) -> PipelineResult<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|dir| self.is_stale(dir))
            .map(|dir| dir.name().to_string())
            .collect())
    }

    /// Marks `name` as read by an executing chain, blocking overwrites.
    pub fn pin_reader(&self, name: &str) {
        *self.pins.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    /// Releases one read pin on `name`.
    pub fn unpin_reader(&self, name: &str) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                pins.remove(name);
            }
        }
    }

    /// Returns true if an executing chain still reads `name`.
    #[must_use]
    pub fn is_pinned(&self, name: &str) -> bool {
        self.pins.lock().contains_key(name)
    }

    /// Acquires a directory for a new run and marks it in progress.
    ///
    /// Every check runs before anything on disk changes, so a rejected
    /// request leaves the store exactly as it was.
    ///
    /// # Errors
    ///
    /// `PredecessorNotReady`, `StaleInProgress`, `AlreadyExists`,
    /// `DirectoryInUse`, or IO errors.
    pub fn begin(&self, request: BeginRequest<'_>) -> PipelineResult<CalcHandle> {
        let name = request.name;
        validate_calc_dir_name(name)?;

        match request.predecessor {
            Some(prev) if self.is_stale(prev) => {
                return Err(PipelineError::StaleInProgress {
                    stage: prev.name().to_string(),
                });
            }
            Some(prev) if !prev.is_complete() => {
                return Err(PipelineError::PredecessorNotReady {
                    stage: name.to_string(),
                    predecessor: Some(prev.name().to_string()),
                    reason: format!("status is {}", prev.status()),
                });
            }
            None if request.requires_predecessor => {
                return Err(PipelineError::PredecessorNotReady {
                    stage: name.to_string(),
                    predecessor: None,
                    reason: "no predecessor declared".to_string(),
                });
            }
            _ => {}
        }

        let mut owners = self.owners.lock();
        if owners.contains(name) {
            return Err(PipelineError::AlreadyExists {
                stage: name.to_string(),
                reason: "held by an active run".to_string(),
            });
        }

        let path = self.dir_path(name);
        match self.read_manifest(&path)? {
            Some(existing) => match existing.status {
                CalcStatus::Complete if !request.overwrite => {
                    return Err(PipelineError::AlreadyExists {
                        stage: name.to_string(),
                        reason: "complete; set overwrite to replace it".to_string(),
                    });
                }
                CalcStatus::InProgress if !request.overwrite => {
                    return Err(PipelineError::StaleInProgress {
                        stage: name.to_string(),
                    });
                }
                CalcStatus::Complete | CalcStatus::InProgress => {
                    self.clear(name, &path, Some(&existing), "overwrite requested")?;
                }
                CalcStatus::Failed | CalcStatus::Absent => {
                    self.clear(name, &path, Some(&existing), "replacing failed run")?;
                }
            },
            None if path.exists() => {
                if !request.overwrite {
                    return Err(PipelineError::AlreadyExists {
                        stage: name.to_string(),
                        reason: "path exists but is not a calculation directory".to_string(),
                    });
                }
                self.clear(name, &path, None, "overwrite requested")?;
            }
            None => {}
        }

        let manifest = CalcManifest {
            name: name.to_string(),
            kind: request.kind,
            variant: request.variant.tag.clone(),
            status: CalcStatus::InProgress,
            run_id: generate_run_id(),
            inputs_used: request.predecessor.map(CalcDirectory::to_predecessor_ref),
            lineage: request
                .predecessor
                .map(|prev| {
                    let mut lineage = prev.lineage().to_vec();
                    lineage.push(prev.name().to_string());
                    lineage
                })
                .unwrap_or_default(),
            params: request.params.clone(),
            output_schema: request.variant.output_schema.clone(),
            inherited: request
                .predecessor
                .map(CalcDirectory::resolved_locations)
                .unwrap_or_default(),
            artifacts: BTreeMap::new(),
            started_at: iso_timestamp(),
            finished_at: None,
            failure: None,
        };

        if let Err(e) = create_layout(&path, &manifest) {
            if e.kind() == io::ErrorKind::AlreadyExists {
                return Err(PipelineError::AlreadyExists {
                    stage: name.to_string(),
                    reason: "locked by another process".to_string(),
                });
            }
            remove_partial_layout(name, &path);
            return Err(PipelineError::io(format!("create {}", path.display()), e));
        }

        owners.insert(name.to_string());
        drop(owners);

        info!(
            calc_dir = %name,
            kind = %request.kind,
            variant = %manifest.variant,
            run_id = %manifest.run_id,
            predecessor = ?request.predecessor.map(CalcDirectory::name),
            "Calculation directory acquired"
        );
        self.events.try_emit(
            names::STAGE_STARTED,
            Some(json!({
                "stage": name,
                "kind": request.kind,
                "variant": manifest.variant,
                "run_id": manifest.run_id,
                "predecessor": request.predecessor.map(CalcDirectory::name),
            })),
        );

        Ok(CalcHandle::new(&self.root, manifest, Arc::clone(&self.owners)))
    }

    /// Freezes the run's artifacts and marks the directory complete.
    ///
    /// Relative locations are resolved against the output directory. Every
    /// schema artifact must exist and be non-empty.
    ///
    /// # Errors
    ///
    /// `IncompleteArtifacts` (the directory is then marked failed) or IO errors.
    /// An artifact whose path cannot be inspected counts as missing.
    pub fn commit(&self, mut handle: CalcHandle, artifacts: ArtifactSet) -> PipelineResult<CalcDirectory> {
        let output_dir = handle.output_dir();
        let mut records = BTreeMap::new();

        for (name, location) in artifacts {
            let path = if location.is_absolute() {
                location
            } else {
                output_dir.join(location)
            };
            match inspect_artifact(&path) {
                Ok(Some(stat)) => {
                    records.insert(
                        name,
                        ArtifactRecord::new(self.relative(&path), stat.size_bytes, stat.sha256),
                    );
                }
                Ok(None) => debug!(calc_dir = %handle.name(), artifact = %name, "Reported artifact missing or empty"),
                Err(e) => warn!(
                    calc_dir = %handle.name(),
                    artifact = %name,
                    path = %path.display(),
                    error = %e,
                    "Reported artifact could not be inspected"
                ),
            }
        }

        let missing: Vec<String> = handle
            .output_schema()
            .iter()
            .filter(|name| !records.contains_key(*name))
            .cloned()
            .collect();

        if !missing.is_empty() {
            let stage = handle.name().to_string();
            let cause = format!("incomplete artifacts: missing {}", missing.join(", "));
            self.finish(&mut handle, CalcStatus::Failed, Some(cause))?;
            self.events.try_emit(
                names::STAGE_FAILED,
                Some(json!({"stage": stage, "code": "CALC-006-INCOMPLETE", "missing": missing})),
            );
            return Err(PipelineError::IncompleteArtifacts { stage, missing });
        }

        handle.manifest.artifacts = records;
        let dir = self.finish(&mut handle, CalcStatus::Complete, None)?;

        info!(
            calc_dir = %dir.name(),
            run_id = %dir.run_id(),
            artifacts = dir.manifest().artifacts.len(),
            "Calculation directory complete"
        );
        self.events.try_emit(
            names::STAGE_COMPLETED,
            Some(json!({
                "stage": dir.name(),
                "variant": dir.variant(),
                "run_id": dir.run_id(),
                "artifacts": dir.manifest().artifacts.keys().collect::<Vec<_>>(),
            })),
        );
        Ok(dir)
    }

    /// Marks the directory failed, keeping its contents for inspection.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the manifest cannot be written.
    pub fn abort(&self, mut handle: CalcHandle, cause: &str) -> PipelineResult<CalcDirectory> {
        let dir = self.finish(&mut handle, CalcStatus::Failed, Some(cause.to_string()))?;
        warn!(calc_dir = %dir.name(), run_id = %dir.run_id(), cause = %cause, "Calculation directory failed");
        self.events.try_emit(
            names::STAGE_FAILED,
            Some(json!({"stage": dir.name(), "run_id": dir.run_id(), "cause": cause})),
        );
        Ok(dir)
    }

    fn finish(
        &self,
        handle: &mut CalcHandle,
        status: CalcStatus,
        failure: Option<String>,
    ) -> PipelineResult<CalcDirectory> {
        handle.manifest.status = status;
        handle.manifest.failure = failure;
        handle.manifest.finished_at = Some(iso_timestamp());
        if status != CalcStatus::Complete {
            handle.manifest.artifacts.clear();
        }

        let result = handle
            .persist()
            .map_err(|e| PipelineError::io(format!("write manifest for {}", handle.name()), e));
        match fs::remove_file(handle.path().join(LOCK_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(calc_dir = %handle.name(), error = %e, "Could not remove lock file"),
        }
        handle.release();
        result?;

        Ok(CalcDirectory::new(&self.root, handle.manifest.clone()))
    }

    /// Deletes a directory's prior contents so its stage can rerun.
    ///
    /// This is irreversible and logged as an audit record.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` while a run owns the directory, `DirectoryInUse` while
    /// an executing chain reads it, or IO errors.
    pub fn overwrite(&self, name: &str) -> PipelineResult<()> {
        validate_calc_dir_name(name)?;
        let owners = self.owners.lock();
        if owners.contains(name) {
            return Err(PipelineError::AlreadyExists {
                stage: name.to_string(),
                reason: "held by an active run".to_string(),
            });
        }
        let path = self.dir_path(name);
        let existing = self.read_manifest(&path)?;
        if path.exists() {
            self.clear(name, &path, existing.as_ref(), "explicit overwrite")?;
        }
        Ok(())
    }

    fn clear(
        &self,
        name: &str,
        path: &Path,
        existing: Option<&CalcManifest>,
        reason: &str,
    ) -> PipelineResult<()> {
        if self.is_pinned(name) {
            return Err(PipelineError::DirectoryInUse {
                stage: name.to_string(),
                reason: "consumed by a stage of the executing chain".to_string(),
            });
        }

        fs::remove_dir_all(path)
            .map_err(|e| PipelineError::io(format!("remove {}", path.display()), e))?;

        warn!(
            calc_dir = %name,
            previous_run_id = ?existing.map(|m| m.run_id),
            previous_status = ?existing.map(|m| m.status),
            artifacts = ?existing.map(|m| m.artifacts.keys().cloned().collect::<Vec<_>>()),
            reason = %reason,
            "Deleted prior calculation directory contents"
        );
        self.events.try_emit(
            names::CALC_OVERWRITTEN,
            Some(json!({
                "stage": name,
                "reason": reason,
                "previous_run_id": existing.map(|m| m.run_id),
                "previous_status": existing.map(|m| m.status),
            })),
        );
        Ok(())
    }

    fn claim_stale(&self, name: &str) -> PipelineResult<CalcHandle> {
        let mut owners = self.owners.lock();
        let manifest = self
            .read_manifest(&self.dir_path(name))?
            .filter(|m| m.status == CalcStatus::InProgress && !owners.contains(name))
            .ok_or_else(|| PipelineError::InvalidParameter {
                stage: name.to_string(),
                param: "calc_dir".to_string(),
                reason: format!("'{name}' is not a stale in-progress directory"),
            })?;
        owners.insert(name.to_string());
        Ok(CalcHandle::new(&self.root, manifest, Arc::clone(&self.owners)))
    }

    /// Re-validates what an interrupted run left in `output/` and finalises it.
    ///
    /// An entry whose file name or stem equals a schema artifact name counts
    /// as that artifact. The directory becomes complete if every schema
    /// artifact is found, failed otherwise.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `name` is not stale, `IncompleteArtifacts`, or IO errors.
    pub fn resume_stale(&self, name: &str) -> PipelineResult<CalcDirectory> {
        validate_calc_dir_name(name)?;
        let handle = self.claim_stale(name)?;
        let found = scan_outputs(&handle.output_dir(), handle.output_schema().iter())
            .map_err(|e| PipelineError::io(format!("scan outputs of {name}"), e))?;

        info!(calc_dir = %name, found = found.len(), "Resuming stale calculation directory");
        self.events.try_emit(
            names::CALC_RESUMED,
            Some(json!({"stage": name, "found": found.keys().collect::<Vec<_>>()})),
        );
        self.commit(handle, found)
    }

    /// Removes a stale directory.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if `name` is not stale, or IO errors.
    pub fn discard_stale(&self, name: &str) -> PipelineResult<()> {
        validate_calc_dir_name(name)?;
        let mut handle = self.claim_stale(name)?;
        let path = handle.path().to_path_buf();
        let run_id = handle.run_id();
        let result = fs::remove_dir_all(&path)
            .map_err(|e| PipelineError::io(format!("remove {}", path.display()), e));
        handle.release();
        result?;

        warn!(calc_dir = %name, run_id = %run_id, "Discarded stale calculation directory");
        self.events.try_emit(
            names::CALC_DISCARDED,
            Some(json!({"stage": name, "run_id": run_id})),
        );
        Ok(())
    }
}

fn create_layout(path: &Path, manifest: &CalcManifest) -> io::Result<()> {
    fs::create_dir_all(path)?;
    let mut lock = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path.join(LOCK_FILE))?;
    writeln!(lock, "{}", manifest.run_id)?;
    fs::create_dir_all(path.join(INPUT_DIR))?;
    fs::create_dir_all(path.join(OUTPUT_DIR))?;
    crate::utils::fs::write_json_atomic(&path.join(MANIFEST_FILE), manifest)
}

/// Removes whatever `create_layout` managed to create before it failed.
fn remove_partial_layout(name: &str, path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(calc_dir = %name, error = %e, "Could not remove partially created directory"),
    }
}

fn scan_outputs<'a>(
    output_dir: &Path,
    schema: impl Iterator<Item = &'a String>,
) -> io::Result<ArtifactSet> {
    let entries: Vec<PathBuf> = match fs::read_dir(output_dir) {
        Ok(entries) => entries
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };

    let mut found = ArtifactSet::new();
    for name in schema {
        let matched = entries.iter().find(|path| {
            let file_name = path.file_name().and_then(|n| n.to_str());
            let stem = path.file_stem().and_then(|n| n.to_str());
            file_name == Some(name.as_str()) || stem == Some(name.as_str())
        });
        if let Some(path) = matched {
            found.insert(name.clone(), path.clone());
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::stages::StageCatalog;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: CalcStore,
        events: Arc<CollectingEventSink>,
        catalog: StageCatalog,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let store = CalcStore::open(tmp.path().join("calcs"))
            .unwrap()
            .with_event_sink(events.clone());
        Fixture {
            _tmp: tmp,
            store,
            events,
            catalog: StageCatalog::standard(),
        }
    }

    fn request<'a>(
        fx: &'a Fixture,
        kind: StageKind,
        name: &'a str,
        predecessor: Option<&'a CalcDirectory>,
        params: &'a ResolvedParams,
        overwrite: bool,
    ) -> BeginRequest<'a> {
        let descriptor = fx.catalog.descriptor(kind);
        BeginRequest {
            name,
            kind,
            variant: descriptor.base_variant(),
            requires_predecessor: descriptor.requires_predecessor,
            predecessor,
            params,
            overwrite,
        }
    }

    fn write_outputs(handle: &CalcHandle, names: &[&str]) -> ArtifactSet {
        names
            .iter()
            .map(|name| {
                let file = format!("{name}.txt");
                fs::write(handle.output_dir().join(&file), format!("{name} data")).unwrap();
                ((*name).to_string(), PathBuf::from(file))
            })
            .collect()
    }

    fn complete_model(fx: &Fixture, name: &str) -> CalcDirectory {
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(fx, StageKind::ModelSelection, name, None, &params, false))
            .unwrap();
        let artifacts = write_outputs(&handle, &["model", "model-comparison"]);
        fx.store.commit(handle, artifacts).unwrap()
    }

    #[test]
    fn test_begin_commit_lifecycle() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();

        let in_progress = fx.store.lookup("00_model").unwrap().unwrap();
        assert_eq!(in_progress.status(), CalcStatus::InProgress);
        assert!(!fx.store.is_stale(&in_progress));
        assert!(handle.path().join(LOCK_FILE).exists());

        let artifacts = write_outputs(&handle, &["model", "model-comparison"]);
        let dir = fx.store.commit(handle, artifacts).unwrap();

        assert_eq!(dir.status(), CalcStatus::Complete);
        assert!(!dir.path().join(LOCK_FILE).exists());
        let record = &dir.manifest().artifacts["model"];
        assert_eq!(record.location, PathBuf::from("00_model/output/model.txt"));
        assert_eq!(record.size_bytes, 10);
        assert_eq!(
            fx.store.lookup("00_model").unwrap().unwrap().status(),
            CalcStatus::Complete
        );
        assert_eq!(fx.events.event_types(), vec!["stage.started", "stage.completed"]);
    }

    #[test]
    fn test_commit_missing_artifact_marks_failed() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        let artifacts = write_outputs(&handle, &["model"]);

        let err = fx.store.commit(handle, artifacts).unwrap_err();
        match err {
            PipelineError::IncompleteArtifacts { stage, missing } => {
                assert_eq!(stage, "00_model");
                assert_eq!(missing, vec!["model-comparison".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let dir = fx.store.lookup("00_model").unwrap().unwrap();
        assert_eq!(dir.status(), CalcStatus::Failed);
        assert!(dir.manifest().artifacts.is_empty());
        assert!(dir.path().join(OUTPUT_DIR).join("model.txt").exists());
    }

    #[test]
    fn test_uninspectable_artifact_marks_failed() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        let mut artifacts = write_outputs(&handle, &["model-comparison"]);
        artifacts.insert("model".to_string(), PathBuf::from("model-comparison.txt/inner"));

        let err = fx.store.commit(handle, artifacts).unwrap_err();
        match err {
            PipelineError::IncompleteArtifacts { stage, missing } => {
                assert_eq!(stage, "00_model");
                assert_eq!(missing, vec!["model".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let dir = fx.store.lookup("00_model").unwrap().unwrap();
        assert_eq!(dir.status(), CalcStatus::Failed);
        assert!(!fx.store.is_stale(&dir));
    }

    #[test]
    fn test_partial_layout_cleanup_failure_is_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let captured = Arc::new(parking_lot::Mutex::new(Vec::<u8>::new()));
        let sink = Arc::clone(&captured);
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || CapturedWriter(Arc::clone(&sink)))
            .finish();

        let partial = tmp.path().join("01_tree");
        fs::create_dir_all(partial.join(INPUT_DIR)).unwrap();
        // A regular file cannot be removed as a directory tree.
        let blocker = tmp.path().join("02_blocked");
        fs::write(&blocker, "not a directory").unwrap();

        tracing::subscriber::with_default(subscriber, || {
            remove_partial_layout("01_tree", &partial);
            remove_partial_layout("00_never-created", &tmp.path().join("00_never-created"));
            remove_partial_layout("02_blocked", &blocker);
        });

        assert!(!partial.exists());
        assert!(blocker.is_file());
        let output = String::from_utf8(captured.lock().clone()).unwrap();
        assert_eq!(output.matches("Could not remove partially created directory").count(), 1);
        assert!(output.contains("02_blocked"));
    }

    struct CapturedWriter(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl io::Write for CapturedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_empty_artifact_counts_as_missing() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        let mut artifacts = write_outputs(&handle, &["model"]);
        fs::write(handle.output_dir().join("cmp.csv"), b"").unwrap();
        artifacts.insert("model-comparison".to_string(), PathBuf::from("cmp.csv"));

        assert!(matches!(
            fx.store.commit(handle, artifacts),
            Err(PipelineError::IncompleteArtifacts { .. })
        ));
    }

    #[test]
    fn test_begin_existing_complete_requires_overwrite() {
        let fx = fixture();
        let first = complete_model(&fx, "00_model");
        let params = ResolvedParams::default();

        let err = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyExists { .. }));
        assert!(fx.store.lookup("00_model").unwrap().unwrap().is_complete());

        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, true))
            .unwrap();
        assert_ne!(handle.run_id(), first.run_id());
        assert!(!handle.output_dir().join("model.txt").exists());
        assert!(fx.events.event_types().contains(&"calc.overwritten".to_string()));
    }

    #[test]
    fn test_begin_requires_complete_predecessor() {
        let fx = fixture();
        let params = ResolvedParams::default();

        let err = fx
            .store
            .begin(request(&fx, StageKind::GeneTree, "01_tree", None, &params, false))
            .unwrap_err();
        assert!(matches!(err, PipelineError::PredecessorNotReady { predecessor: None, .. }));

        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        let failed = fx.store.abort(handle, "boom").unwrap();

        let err = fx
            .store
            .begin(request(&fx, StageKind::GeneTree, "01_tree", Some(&failed), &params, false))
            .unwrap_err();
        assert!(matches!(err, PipelineError::PredecessorNotReady { .. }));
        assert!(fx.store.lookup("01_tree").unwrap().is_none());
    }

    #[test]
    fn test_lineage_and_inherited_view() {
        let fx = fixture();
        let model = complete_model(&fx, "00_model");
        let params = ResolvedParams::default();

        let handle = fx
            .store
            .begin(request(&fx, StageKind::GeneTree, "01_tree", Some(&model), &params, false))
            .unwrap();
        assert_eq!(handle.inputs()["model"], model.artifact_path("model").unwrap());
        let artifacts = write_outputs(&handle, &["gene-tree"]);
        let tree = fx.store.commit(handle, artifacts).unwrap();

        assert_eq!(tree.lineage(), ["00_model".to_string()]);
        assert_eq!(tree.manifest().inputs_used.as_ref().unwrap().run_id, model.run_id());
        let view = tree.resolved_artifacts();
        assert!(view.contains_key("model"));
        assert!(view.contains_key("gene-tree"));
    }

    #[test]
    fn test_concurrent_begin_same_name_is_exclusive() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let _held = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, true))
            .unwrap();

        let err = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, true))
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyExists { .. }));
    }

    #[test]
    fn test_dropped_handle_leaves_stale_directory() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        drop(handle);

        assert_eq!(fx.store.stale().unwrap(), vec!["00_model".to_string()]);
        let stale = fx.store.lookup("00_model").unwrap().unwrap();

        let err = fx
            .store
            .begin(request(&fx, StageKind::GeneTree, "01_tree", Some(&stale), &params, false))
            .unwrap_err();
        assert!(matches!(err, PipelineError::StaleInProgress { ref stage } if stage == "00_model"));

        let err = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap_err();
        assert!(matches!(err, PipelineError::StaleInProgress { .. }));
    }

    #[test]
    fn test_stale_detected_by_fresh_store() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let _handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();

        let reopened = CalcStore::open(fx.store.root()).unwrap();
        assert_eq!(reopened.stale().unwrap(), vec!["00_model".to_string()]);
        assert!(fx.store.stale().unwrap().is_empty());
    }

    #[test]
    fn test_resume_stale_completes_when_outputs_present() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        write_outputs(&handle, &["model", "model-comparison"]);
        drop(handle);

        let dir = fx.store.resume_stale("00_model").unwrap();
        assert!(dir.is_complete());
        assert!(fx.store.stale().unwrap().is_empty());
        assert!(fx.store.resume_stale("00_model").is_err());
    }

    #[test]
    fn test_resume_stale_fails_when_outputs_missing() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        write_outputs(&handle, &["model"]);
        drop(handle);

        assert!(matches!(
            fx.store.resume_stale("00_model"),
            Err(PipelineError::IncompleteArtifacts { .. })
        ));
        assert_eq!(
            fx.store.lookup("00_model").unwrap().unwrap().status(),
            CalcStatus::Failed
        );
    }

    #[test]
    fn test_discard_stale_removes_directory() {
        let fx = fixture();
        let params = ResolvedParams::default();
        drop(
            fx.store
                .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
                .unwrap(),
        );

        fx.store.discard_stale("00_model").unwrap();
        assert!(fx.store.lookup("00_model").unwrap().is_none());
        assert!(fx.events.event_types().contains(&"calc.discarded".to_string()));
    }

    #[test]
    fn test_pinned_directory_cannot_be_overwritten() {
        let fx = fixture();
        complete_model(&fx, "00_model");
        fx.store.pin_reader("00_model");

        assert!(matches!(
            fx.store.overwrite("00_model"),
            Err(PipelineError::DirectoryInUse { .. })
        ));
        let params = ResolvedParams::default();
        assert!(matches!(
            fx.store
                .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, true)),
            Err(PipelineError::DirectoryInUse { .. })
        ));
        assert!(fx.store.lookup("00_model").unwrap().unwrap().is_complete());

        fx.store.unpin_reader("00_model");
        fx.store.overwrite("00_model").unwrap();
        assert!(fx.store.lookup("00_model").unwrap().is_none());
    }

    #[test]
    fn test_failed_directory_can_rerun_without_overwrite() {
        let fx = fixture();
        let params = ResolvedParams::default();
        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        fx.store.abort(handle, "engine crashed").unwrap();

        let handle = fx
            .store
            .begin(request(&fx, StageKind::ModelSelection, "00_model", None, &params, false))
            .unwrap();
        assert_eq!(handle.name(), "00_model");
    }

    #[test]
    fn test_foreign_directory_requires_overwrite() {
        let fx = fixture();
        fs::create_dir_all(fx.store.root().join("notes")).unwrap();
        let params = ResolvedParams::default();

        assert!(matches!(
            fx.store
                .begin(request(&fx, StageKind::ModelSelection, "notes", None, &params, false)),
            Err(PipelineError::AlreadyExists { .. })
        ));
        assert!(fx.store.list().unwrap().is_empty());
    }
}
