//! Executes one stage against the calculation directory store.
//!
//! Every validation (params, predecessor, lineage, required inputs) happens
//! before the store is asked for a directory, so a rejected invocation
//! leaves no trace on disk.

use crate::core::{ResolvedParams, StageKind};
use crate::engines::{EngineRequest, EngineSet};
use crate::errors::{PipelineError, PipelineResult};
use crate::observability::stage_span;
use crate::stages::{StageCatalog, StageDescriptor, StageInvocation, StageVariant};
use crate::store::{BeginRequest, CalcDirectory, CalcHandle, CalcStore};
use crate::utils::fs::copy_recursive;
use crate::utils::validate_calc_dir_name;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// A validated invocation, ready to acquire its directory.
#[derive(Debug)]
struct Prepared<'a> {
    descriptor: &'a StageDescriptor,
    variant: &'a StageVariant,
    params: ResolvedParams,
    predecessor: Option<CalcDirectory>,
    overrides: BTreeMap<String, PathBuf>,
}

/// Runs stages one at a time.
#[derive(Debug, Clone)]
pub struct StageRunner {
    store: Arc<CalcStore>,
    engines: EngineSet,
    catalog: StageCatalog,
}

impl StageRunner {
    /// Creates a runner with the standard catalog.
    #[must_use]
    pub fn new(store: Arc<CalcStore>, engines: EngineSet) -> Self {
        Self {
            store,
            engines,
            catalog: StageCatalog::standard(),
        }
    }

    /// Replaces the stage catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: StageCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<CalcStore> {
        &self.store
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Returns the descriptor for a kind.
    #[must_use]
    pub fn descriptor(&self, kind: StageKind) -> &StageDescriptor {
        self.catalog.descriptor(kind)
    }

    /// Runs one stage to a terminal state.
    ///
    /// # Errors
    ///
    /// Validation errors leave the store untouched. `EngineExecutionFailed`
    /// and `IncompleteArtifacts` leave the directory failed.
    pub async fn run(&self, invocation: &StageInvocation) -> PipelineResult<CalcDirectory> {
        self.run_in_span(invocation).instrument(stage_span(invocation)).await
    }

    async fn run_in_span(&self, invocation: &StageInvocation) -> PipelineResult<CalcDirectory> {
        let started = Instant::now();
        let prepared = self.prepare(invocation)?;

        let handle = self.store.begin(BeginRequest {
            name: &invocation.calc_dir,
            kind: invocation.kind,
            variant: prepared.variant,
            requires_predecessor: prepared.descriptor.requires_predecessor,
            predecessor: prepared.predecessor.as_ref(),
            params: &prepared.params,
            overwrite: invocation.overwrite,
        })?;

        let handle = match self.stage_inputs(handle, &prepared.overrides) {
            Ok(handle) => handle,
            Err((handle, err)) => {
                self.abort_quietly(handle, &err.to_string());
                return Err(err);
            }
        };

        let inputs = handle.inputs();
        let params = engine_params(prepared.descriptor, &prepared.params, &inputs);
        let request = EngineRequest {
            stage: invocation.calc_dir.clone(),
            kind: invocation.kind,
            variant: handle.variant().to_string(),
            calc_dir: handle.path().to_path_buf(),
            output_dir: handle.output_dir(),
            inputs,
            params,
            output_schema: handle.output_schema().clone(),
        };

        let engine = self.engines.engine_for(invocation.kind);
        debug!(calc_dir = %invocation.calc_dir, engine = %engine.name(), "Invoking engine");

        match engine.execute(&request).await {
            Ok(artifacts) => {
                let dir = self.store.commit(handle, artifacts)?;
                info!(
                    calc_dir = %dir.name(),
                    variant = %dir.variant(),
                    duration_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "Stage completed"
                );
                Ok(dir)
            }
            Err(failure) => {
                self.abort_quietly(handle, &failure.to_string());
                Err(PipelineError::EngineExecutionFailed {
                    stage: invocation.calc_dir.clone(),
                    failure,
                })
            }
        }
    }

    fn prepare(&self, invocation: &StageInvocation) -> PipelineResult<Prepared<'_>> {
        let name = invocation.calc_dir.as_str();
        validate_calc_dir_name(name)?;

        let descriptor = self.catalog.descriptor(invocation.kind);
        let params = descriptor.validate_params(name, &invocation.params)?;
        let variant = descriptor.variant_for(&params);
        let overrides = descriptor.input_overrides(&params);

        let predecessor = match invocation.prev_calculation.as_deref() {
            Some(prev) => Some(self.resolve_predecessor(name, prev, variant)?),
            None if descriptor.requires_predecessor => {
                return Err(PipelineError::PredecessorNotReady {
                    stage: name.to_string(),
                    predecessor: None,
                    reason: format!("{} requires a predecessor", descriptor.name),
                });
            }
            None => None,
        };

        let mut available = predecessor
            .as_ref()
            .map(CalcDirectory::resolved_locations)
            .unwrap_or_default();
        available.extend(overrides.clone());
        let missing: Vec<&str> = variant
            .required_inputs
            .iter()
            .filter(|input| !available.contains_key(*input))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::PredecessorNotReady {
                stage: name.to_string(),
                predecessor: invocation.prev_calculation.clone(),
                reason: format!("missing required inputs: {}", missing.join(", ")),
            });
        }

        debug!(calc_dir = %name, variant = %variant.tag, "Invocation validated");
        Ok(Prepared {
            descriptor,
            variant,
            params,
            predecessor,
            overrides,
        })
    }

    fn resolve_predecessor(
        &self,
        name: &str,
        prev: &str,
        variant: &StageVariant,
    ) -> PipelineResult<CalcDirectory> {
        if prev == name {
            return Err(PipelineError::CycleDetected {
                stage: name.to_string(),
                cycle_path: vec![name.to_string(), name.to_string()],
            });
        }

        let not_ready = |reason: String| PipelineError::PredecessorNotReady {
            stage: name.to_string(),
            predecessor: Some(prev.to_string()),
            reason,
        };

        let dir = self
            .store
            .lookup(prev)?
            .ok_or_else(|| not_ready("does not exist".to_string()))?;

        if self.store.is_stale(&dir) {
            return Err(PipelineError::StaleInProgress {
                stage: prev.to_string(),
            });
        }
        if !dir.is_complete() {
            return Err(not_ready(format!("status is {}", dir.status())));
        }
        if !variant.accepts_predecessor(dir.kind()) {
            return Err(not_ready(format!(
                "{} does not accept a {} predecessor",
                variant.tag,
                dir.kind()
            )));
        }
        if dir.lineage().iter().any(|ancestor| ancestor == name) {
            let mut cycle_path = dir.lineage().to_vec();
            cycle_path.push(prev.to_string());
            cycle_path.push(name.to_string());
            return Err(PipelineError::CycleDetected {
                stage: name.to_string(),
                cycle_path,
            });
        }

        Ok(dir)
    }

    fn stage_inputs(
        &self,
        mut handle: CalcHandle,
        overrides: &BTreeMap<String, PathBuf>,
    ) -> Result<CalcHandle, (CalcHandle, PipelineError)> {
        if overrides.is_empty() {
            return Ok(handle);
        }

        let mut copied = BTreeMap::new();
        for (artifact, source) in overrides {
            let mut file_name = artifact.clone();
            if let Some(ext) = source.extension().and_then(|e| e.to_str()) {
                file_name.push('.');
                file_name.push_str(ext);
            }
            let dest = handle.input_dir().join(file_name);
            if let Err(e) = copy_recursive(source, &dest) {
                let err = PipelineError::io(format!("copy input {}", source.display()), e);
                return Err((handle, err));
            }
            debug!(calc_dir = %handle.name(), artifact = %artifact, "Copied input override");
            copied.insert(artifact.clone(), dest);
        }

        match handle.record_inputs(copied) {
            Ok(()) => Ok(handle),
            Err(e) => {
                let err = PipelineError::io(format!("record inputs for {}", handle.name()), e);
                Err((handle, err))
            }
        }
    }

    fn abort_quietly(&self, handle: CalcHandle, cause: &str) {
        let name = handle.name().to_string();
        if let Err(e) = self.store.abort(handle, cause) {
            warn!(calc_dir = %name, error = %e, "Could not mark calculation directory failed");
        }
    }
}

/// Resolved params as the engine sees them: file params point at their staged copies.
fn engine_params(
    descriptor: &StageDescriptor,
    params: &ResolvedParams,
    inputs: &BTreeMap<String, PathBuf>,
) -> BTreeMap<String, Value> {
    let mut resolved = params.as_map().clone();
    for spec in &descriptor.accepts_params {
        let Some(artifact) = spec.input_artifact() else {
            continue;
        };
        if let (Some(value), Some(staged)) = (resolved.get_mut(&spec.name), inputs.get(artifact)) {
            *value = Value::String(staged.to_string_lossy().into_owned());
        }
    }
    resolved
}
