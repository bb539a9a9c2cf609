//! Caller requests to run a stage.

use crate::core::{Params, StageKind};
use serde::{Deserialize, Serialize};

/// One request to run a stage, as it appears in a chain file.
///
/// ```json
/// {"kind": "gene_tree", "calc_dir": "01_gene-tree",
///  "prev_calculation": "00_find-model", "params": {"num_threads": 4}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInvocation {
    /// Which stage to run.
    pub kind: StageKind,
    /// Name of the calculation directory to create.
    pub calc_dir: String,
    /// Name of the predecessor directory, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_calculation: Option<String>,
    /// Stage-specific options.
    #[serde(default)]
    pub params: Params,
    /// Whether an existing complete directory may be replaced.
    #[serde(default)]
    pub overwrite: bool,
}

impl StageInvocation {
    /// Creates an invocation with no predecessor and no params.
    #[must_use]
    pub fn new(kind: StageKind, calc_dir: impl Into<String>) -> Self {
        Self {
            kind,
            calc_dir: calc_dir.into(),
            prev_calculation: None,
            params: Params::new(),
            overwrite: false,
        }
    }

    /// Sets the predecessor directory.
    #[must_use]
    pub fn after(mut self, prev_calculation: impl Into<String>) -> Self {
        self.prev_calculation = Some(prev_calculation.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Sets the overwrite flag.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}
