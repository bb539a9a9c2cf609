//! The boundary to the external statistical engines.
//!
//! The core never looks inside an engine. It hands over an [`EngineRequest`]
//! and gets back either the artifact locations the engine wrote or the
//! engine's own failure signal.

mod command;

pub use command::{CommandEngine, REQUEST_FILE};

use crate::core::{ArtifactSet, StageKind};
use crate::errors::EngineFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Everything an engine needs to run one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    /// Calculation directory name.
    pub stage: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Variant tag.
    pub variant: String,
    /// Absolute calculation directory path.
    pub calc_dir: PathBuf,
    /// Directory the engine must write its artifacts into.
    pub output_dir: PathBuf,
    /// Resolved input artifact paths, keyed by artifact name.
    pub inputs: BTreeMap<String, PathBuf>,
    /// Validated parameters.
    pub params: BTreeMap<String, Value>,
    /// Artifacts the engine is expected to produce.
    pub output_schema: BTreeSet<String>,
}

impl EngineRequest {
    /// Returns a resolved input path.
    #[must_use]
    pub fn input(&self, artifact: &str) -> Option<&PathBuf> {
        self.inputs.get(artifact)
    }
}

/// An external engine behind one stage kind.
#[async_trait]
pub trait Engine: Send + Sync + fmt::Debug {
    /// Engine name used in logs.
    fn name(&self) -> &str;

    /// Runs the engine to completion.
    async fn execute(&self, request: &EngineRequest) -> Result<ArtifactSet, EngineFailure>;
}

type EngineFuture = Pin<Box<dyn Future<Output = Result<ArtifactSet, EngineFailure>> + Send>>;

/// An engine backed by an async closure.
pub struct FnEngine {
    name: String,
    func: Box<dyn Fn(EngineRequest) -> EngineFuture + Send + Sync>,
}

impl FnEngine {
    /// Wraps a closure.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(EngineRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ArtifactSet, EngineFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(move |request| Box::pin(func(request))),
        }
    }
}

impl fmt::Debug for FnEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEngine").field("name", &self.name).finish_non_exhaustive()
    }
}

#[async_trait]
impl Engine for FnEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &EngineRequest) -> Result<ArtifactSet, EngineFailure> {
        (self.func)(request.clone()).await
    }
}

/// One engine per stage kind.
#[derive(Debug, Clone)]
pub struct EngineSet {
    /// Substitution model selector.
    pub model_selector: Arc<dyn Engine>,
    /// Maximum-likelihood tree inferer.
    pub tree_inferer: Arc<dyn Engine>,
    /// Ancestral state reconstructor.
    pub ancestor_reconstructor: Arc<dyn Engine>,
    /// Gene/species tree reconciler.
    pub reconciler: Arc<dyn Engine>,
    /// Bootstrap resampler.
    pub bootstrap_resampler: Arc<dyn Engine>,
}

impl EngineSet {
    /// Builds a set from one engine per slot.
    #[must_use]
    pub fn new(
        model_selector: Arc<dyn Engine>,
        tree_inferer: Arc<dyn Engine>,
        ancestor_reconstructor: Arc<dyn Engine>,
        reconciler: Arc<dyn Engine>,
        bootstrap_resampler: Arc<dyn Engine>,
    ) -> Self {
        Self {
            model_selector,
            tree_inferer,
            ancestor_reconstructor,
            reconciler,
            bootstrap_resampler,
        }
    }

    /// Uses the same engine for every kind.
    #[must_use]
    pub fn uniform(engine: Arc<dyn Engine>) -> Self {
        Self::new(
            Arc::clone(&engine),
            Arc::clone(&engine),
            Arc::clone(&engine),
            Arc::clone(&engine),
            engine,
        )
    }

    /// Returns the engine for a stage kind.
    #[must_use]
    pub fn engine_for(&self, kind: StageKind) -> &Arc<dyn Engine> {
        match kind {
            StageKind::ModelSelection => &self.model_selector,
            StageKind::GeneTree => &self.tree_inferer,
            StageKind::Ancestors => &self.ancestor_reconstructor,
            StageKind::Reconcile => &self.reconciler,
            StageKind::Bootstrap => &self.bootstrap_resampler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EngineRequest {
        EngineRequest {
            stage: "01_tree".to_string(),
            kind: StageKind::GeneTree,
            variant: "gene_tree".to_string(),
            calc_dir: PathBuf::from("/store/01_tree"),
            output_dir: PathBuf::from("/store/01_tree/output"),
            inputs: BTreeMap::from([("model".to_string(), PathBuf::from("/store/00/output/model.txt"))]),
            params: BTreeMap::new(),
            output_schema: BTreeSet::from(["gene-tree".to_string()]),
        }
    }

    #[tokio::test]
    async fn test_fn_engine() {
        let engine = FnEngine::new("tree", |req: EngineRequest| async move {
            Ok(ArtifactSet::from([(
                "gene-tree".to_string(),
                req.output_dir.join("tree.newick"),
            )]))
        });

        let artifacts = engine.execute(&request()).await.unwrap();
        assert_eq!(engine.name(), "tree");
        assert_eq!(
            artifacts["gene-tree"],
            PathBuf::from("/store/01_tree/output/tree.newick")
        );
    }

    #[test]
    fn test_engine_set_routes_by_kind() {
        let named = |name: &'static str| -> Arc<dyn Engine> {
            Arc::new(FnEngine::new(name, |_req: EngineRequest| async {
                Err(EngineFailure::new("unused"))
            }))
        };
        let set = EngineSet::new(
            named("iqtree"),
            named("raxml"),
            named("pastml"),
            named("generax"),
            named("bootstrap"),
        );

        assert_eq!(set.engine_for(StageKind::ModelSelection).name(), "iqtree");
        assert_eq!(set.engine_for(StageKind::Reconcile).name(), "generax");
        assert_eq!(set.engine_for(StageKind::Bootstrap).name(), "bootstrap");
    }

    #[test]
    fn test_request_serializes_for_subprocess() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(value["kind"], "gene_tree");
        assert_eq!(value["inputs"]["model"], "/store/00/output/model.txt");
        assert_eq!(request().input("model"), Some(&PathBuf::from("/store/00/output/model.txt")));
    }
}
