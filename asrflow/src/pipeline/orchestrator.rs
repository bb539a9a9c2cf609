//! Sequential chain execution.

use super::PipelineChain;
use crate::errors::{PipelineError, PipelineResult};
use crate::events::{names, EventSink};
use crate::runner::StageRunner;
use crate::stages::StageInvocation;
use crate::store::{CalcDirectory, CalcStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Result of executing a chain.
#[derive(Debug)]
pub struct ChainExecutionResult {
    /// Directories completed by this execution, in chain order.
    pub directories: Vec<CalcDirectory>,
    /// Total execution time in milliseconds.
    pub duration_ms: f64,
    /// Whether every stage completed.
    pub success: bool,
    /// The first failure, if any.
    pub error: Option<PipelineError>,
}

impl ChainExecutionResult {
    /// Returns the calc dir name of the stage that failed.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        self.error.as_ref().and_then(PipelineError::stage)
    }

    /// Converts into a plain result, dropping the partial progress on failure.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure.
    pub fn into_result(self) -> PipelineResult<Vec<CalcDirectory>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.directories),
        }
    }
}

/// Releases every read pin taken during one execution.
struct PinGuard<'a> {
    store: &'a CalcStore,
    pinned: Vec<String>,
}

impl PinGuard<'_> {
    fn pin(&mut self, name: &str) {
        self.store.pin_reader(name);
        self.pinned.push(name.to_string());
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        for name in self.pinned.drain(..) {
            self.store.unpin_reader(&name);
        }
    }
}

/// Runs chains of stages strictly in order.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    runner: StageRunner,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Creates an orchestrator publishing to the store's event sink.
    #[must_use]
    pub fn new(runner: StageRunner) -> Self {
        let events = runner.store().events();
        Self { runner, events }
    }

    /// Returns the stage runner.
    #[must_use]
    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<CalcStore> {
        self.runner.store()
    }

    /// Runs a single stage outside any chain.
    ///
    /// # Errors
    ///
    /// Any error the stage raises.
    pub async fn run_stage(&self, invocation: &StageInvocation) -> PipelineResult<CalcDirectory> {
        self.runner.run(invocation).await
    }

    /// Validates and executes a chain.
    ///
    /// Predecessors resolve against directories completed earlier in this
    /// execution or left by earlier runs. Each consumed predecessor is pinned
    /// until execution ends, so no later overwrite can pull it out from under
    /// a stage that already read it. The first failing stage stops the chain;
    /// directories completed before it stay complete.
    ///
    /// # Errors
    ///
    /// Chain-shape errors (`InvalidChain`, `CycleDetected`, `DirectoryInUse`)
    /// are returned before any stage runs. Stage failures are reported in the
    /// result.
    pub async fn execute(&self, chain: &PipelineChain) -> PipelineResult<ChainExecutionResult> {
        chain.validate()?;

        let started = Instant::now();
        let store = self.runner.store();
        let mut pins = PinGuard {
            store,
            pinned: Vec::new(),
        };
        let mut directories = Vec::with_capacity(chain.len());
        let mut failure = None;

        info!(stages = chain.len(), root = %store.root().display(), "Chain started");
        self.events
            .emit(
                names::CHAIN_STARTED,
                Some(json!({
                    "stages": chain.stages.iter().map(|s| s.calc_dir.as_str()).collect::<Vec<_>>(),
                })),
            )
            .await;

        for invocation in &chain.stages {
            if let Some(prev) = invocation.prev_calculation.as_deref() {
                pins.pin(prev);
            }
            match self.runner.run(invocation).await {
                Ok(dir) => directories.push(dir),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        drop(pins);

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &failure {
            None => {
                info!(stages = directories.len(), duration_ms, "Chain completed");
                self.events
                    .emit(
                        names::CHAIN_COMPLETED,
                        Some(json!({"completed": directories.len(), "duration_ms": duration_ms})),
                    )
                    .await;
            }
            Some(err) => {
                error!(
                    stage = ?err.stage(),
                    code = err.code(),
                    completed = directories.len(),
                    error = %err,
                    "Chain stopped"
                );
                self.events
                    .emit(
                        names::CHAIN_FAILED,
                        Some(json!({
                            "completed": directories.len(),
                            "duration_ms": duration_ms,
                            "error": err.to_dict(),
                        })),
                    )
                    .await;
            }
        }

        Ok(ChainExecutionResult {
            success: failure.is_none(),
            directories,
            duration_ms,
            error: failure,
        })
    }
}
