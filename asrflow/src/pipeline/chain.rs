//! Declared chains of stage invocations.

use crate::errors::{PipelineError, PipelineResult};
use crate::stages::StageInvocation;
use crate::utils::validate_calc_dir_name;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// An ordered list of stage invocations.
///
/// Serialised as `{"stages": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineChain {
    /// Invocations in execution order.
    pub stages: Vec<StageInvocation>,
}

impl PipelineChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an invocation.
    #[must_use]
    pub fn stage(mut self, invocation: StageInvocation) -> Self {
        self.stages.push(invocation);
        self
    }

    /// Loads a chain from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an IO or serialization error.
    pub fn from_json_file(path: &Path) -> PipelineResult<Self> {
        let body = std::fs::read(path)
            .map_err(|e| PipelineError::io(format!("read chain {}", path.display()), e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the chain has no invocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Checks the chain's shape before anything runs.
    ///
    /// # Errors
    ///
    /// - `InvalidChain` for an empty chain or a repeated directory without overwrite
    /// - `CycleDetected` if following predecessors ever leads back to a stage
    /// - `DirectoryInUse` if a directory is consumed before a later stage rewrites it
    pub fn validate(&self) -> PipelineResult<()> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidChain {
                reason: "chain has no stages".to_string(),
            });
        }

        for invocation in &self.stages {
            validate_calc_dir_name(&invocation.calc_dir)?;
            if let Some(prev) = &invocation.prev_calculation {
                validate_calc_dir_name(prev)?;
            }
        }

        if let Some(cycle) = self.detect_cycle() {
            return Err(PipelineError::CycleDetected {
                stage: cycle.first().cloned().unwrap_or_default(),
                cycle_path: cycle,
            });
        }

        let mut produced = HashSet::new();
        for invocation in &self.stages {
            if !produced.insert(invocation.calc_dir.as_str()) && !invocation.overwrite {
                return Err(PipelineError::InvalidChain {
                    reason: format!(
                        "'{}' is produced more than once; set overwrite on the rerun",
                        invocation.calc_dir
                    ),
                });
            }
        }

        for (index, consumer) in self.stages.iter().enumerate() {
            let Some(prev) = consumer.prev_calculation.as_deref() else {
                continue;
            };
            if let Some(later) = self.stages[index + 1..]
                .iter()
                .find(|later| later.calc_dir == prev)
            {
                return Err(PipelineError::DirectoryInUse {
                    stage: later.calc_dir.clone(),
                    reason: format!(
                        "'{}' reads it before a later {} stage rewrites it",
                        consumer.calc_dir, later.kind
                    ),
                });
            }
        }

        Ok(())
    }

    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for invocation in &self.stages {
            let deps = edges.entry(invocation.calc_dir.as_str()).or_default();
            if let Some(prev) = invocation.prev_calculation.as_deref() {
                deps.push(prev);
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        for invocation in &self.stages {
            let node = invocation.calc_dir.as_str();
            if !visited.contains(node) {
                if let Some(cycle) = dfs_cycle(&edges, node, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

fn dfs_cycle<'a>(
    edges: &HashMap<&'a str, Vec<&'a str>>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for &dep in edges.get(node).into_iter().flatten() {
        if !visited.contains(dep) {
            if let Some(cycle) = dfs_cycle(edges, dep, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(dep) {
            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(dep.to_string());
            return Some(cycle);
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn standard() -> PipelineChain {
        PipelineChain::new()
            .stage(StageInvocation::new(StageKind::ModelSelection, "00_find-model"))
            .stage(StageInvocation::new(StageKind::GeneTree, "01_gene-tree").after("00_find-model"))
            .stage(StageInvocation::new(StageKind::Ancestors, "02_ancestors").after("01_gene-tree"))
    }

    #[test]
    fn test_linear_chain_is_valid() {
        assert!(standard().validate().is_ok());
        assert_eq!(standard().len(), 3);
    }

    #[test]
    fn test_empty_chain() {
        let err = PipelineChain::new().validate().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChain { .. }));
    }

    #[test]
    fn test_mutual_predecessors_form_a_cycle() {
        let chain = PipelineChain::new()
            .stage(StageInvocation::new(StageKind::GeneTree, "A").after("B"))
            .stage(StageInvocation::new(StageKind::GeneTree, "B").after("A"));

        match chain.validate().unwrap_err() {
            PipelineError::CycleDetected { cycle_path, .. } => {
                assert_eq!(cycle_path, vec!["A", "B", "A"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rerun_naming_its_consumer_is_a_cycle() {
        let chain = standard().stage(
            StageInvocation::new(StageKind::GeneTree, "00_find-model")
                .after("01_gene-tree")
                .overwrite(true),
        );
        assert!(matches!(chain.validate(), Err(PipelineError::CycleDetected { .. })));
    }

    #[test]
    fn test_self_reference() {
        let chain = PipelineChain::new()
            .stage(StageInvocation::new(StageKind::GeneTree, "01_gene-tree").after("01_gene-tree"));
        assert!(matches!(chain.validate(), Err(PipelineError::CycleDetected { .. })));
    }

    #[test]
    fn test_duplicate_without_overwrite() {
        let chain = standard().stage(StageInvocation::new(StageKind::ModelSelection, "02_ancestors"));
        assert!(matches!(chain.validate(), Err(PipelineError::InvalidChain { .. })));
    }

    #[test]
    fn test_rerun_of_consumed_directory() {
        let chain = standard().stage(
            StageInvocation::new(StageKind::ModelSelection, "00_find-model").overwrite(true),
        );
        match chain.validate().unwrap_err() {
            PipelineError::DirectoryInUse { stage, .. } => assert_eq!(stage, "00_find-model"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_chain_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.json");
        let body = json!({
            "stages": [
                {"kind": "model_selection", "calc_dir": "00_find-model",
                 "params": {"alignment": "family.phy"}},
                {"kind": "reconcile", "calc_dir": "05_reconcile-bs",
                 "prev_calculation": "04_bootstraps", "params": {"bootstrap": true},
                 "overwrite": true}
            ]
        });
        std::fs::write(&path, body.to_string()).unwrap();

        let chain = PipelineChain::from_json_file(&path).unwrap();
        assert_eq!(chain.stages[1].kind, StageKind::Reconcile);
        assert!(chain.stages[1].overwrite);
        assert!(PipelineChain::from_json_file(&dir.path().join("missing.json")).is_err());
    }
}
