//! Mock engines for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;

use crate::core::ArtifactSet;
use crate::engines::{Engine, EngineRequest};
use crate::errors::EngineFailure;
use crate::stages::artifacts::BOOTSTRAP_REPLICATES;

/// An engine that writes one small file per schema artifact and records calls.
///
/// Directory artifacts (bootstrap replicates by default) are written as a
/// directory holding one replicate file.
#[derive(Debug)]
pub struct ArtifactWritingEngine {
    name: String,
    omitted: BTreeSet<String>,
    directories: BTreeSet<String>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ArtifactWritingEngine {
    /// Creates a new engine.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            omitted: BTreeSet::new(),
            directories: BTreeSet::from([BOOTSTRAP_REPLICATES.to_string()]),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Never writes `artifact`, while still reporting success.
    #[must_use]
    pub fn omitting(mut self, artifact: impl Into<String>) -> Self {
        self.omitted.insert(artifact.into());
        self
    }

    /// Returns the number of times the engine was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns every request received, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().clone()
    }

    /// Returns the calc dir names the engine ran for, in call order.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.stage.clone()).collect()
    }

    fn write(&self, request: &EngineRequest, artifact: &str) -> std::io::Result<std::path::PathBuf> {
        let body = format!("{artifact} from {} ({})\n", request.stage, request.variant);
        if self.directories.contains(artifact) {
            let dir = request.output_dir.join(artifact);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("replicate_0.newick"), body)?;
            return Ok(dir);
        }
        let file = format!("{artifact}.txt");
        fs::write(request.output_dir.join(&file), body)?;
        Ok(file.into())
    }
}

#[async_trait]
impl Engine for ArtifactWritingEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &EngineRequest) -> Result<ArtifactSet, EngineFailure> {
        self.requests.lock().push(request.clone());

        let mut artifacts = ArtifactSet::new();
        for artifact in &request.output_schema {
            if self.omitted.contains(artifact) {
                continue;
            }
            let path = self
                .write(request, artifact)
                .map_err(|e| EngineFailure::new(format!("mock write failed: {e}")))?;
            artifacts.insert(artifact.clone(), path);
        }
        Ok(artifacts)
    }
}

/// An engine that always fails with a fixed diagnostic.
#[derive(Debug)]
pub struct FailingEngine {
    name: String,
    failure: EngineFailure,
    calls: Mutex<usize>,
}

impl FailingEngine {
    /// Creates a failing engine.
    #[must_use]
    pub fn new(name: impl Into<String>, failure: EngineFailure) -> Self {
        Self {
            name: name.into(),
            failure,
            calls: Mutex::new(0),
        }
    }

    /// Returns the number of times the engine was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Engine for FailingEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _request: &EngineRequest) -> Result<ArtifactSet, EngineFailure> {
        *self.calls.lock() += 1;
        Err(self.failure.clone())
    }
}
