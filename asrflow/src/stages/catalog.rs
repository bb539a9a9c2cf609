//! The standard descriptors for the five stage kinds.

use super::{StageDescriptor, StageVariant};
use crate::core::{ParamDomain, ParamSpec, StageKind, SUPPORTED_MODEL_MATRICES};
use serde_json::json;
use std::collections::BTreeSet;

/// Artifact names exchanged between stages.
pub mod artifacts {
    /// Input multiple sequence alignment.
    pub const ALIGNMENT: &str = "alignment";
    /// Selected substitution model.
    pub const MODEL: &str = "model";
    /// Per-model likelihood comparison table.
    pub const MODEL_COMPARISON: &str = "model-comparison";
    /// Maximum-likelihood gene tree.
    pub const GENE_TREE: &str = "gene-tree";
    /// Reconstructed ancestral sequences.
    pub const ANCESTORS: &str = "ancestors";
    /// Tree labelled with ancestor names.
    pub const ANCESTOR_TREE: &str = "ancestor-tree";
    /// Species tree used for reconciliation.
    pub const SPECIES_TREE: &str = "species-tree";
    /// Gene tree reconciled with the species tree.
    pub const RECONCILED_TREE: &str = "reconciled-tree";
    /// Duplication/loss/transfer event summary.
    pub const RECONCILIATION: &str = "reconciliation";
    /// Directory of bootstrap replicate trees.
    pub const BOOTSTRAP_REPLICATES: &str = "bootstrap-replicates";
    /// Gene tree annotated with branch supports.
    pub const SUPPORT_TREE: &str = "support-tree";
}

use artifacts::{
    ALIGNMENT, ANCESTORS, ANCESTOR_TREE, BOOTSTRAP_REPLICATES, GENE_TREE, MODEL,
    MODEL_COMPARISON, RECONCILED_TREE, RECONCILIATION, SPECIES_TREE, SUPPORT_TREE,
};

/// Descriptors for every stage kind, with per-variant schemas adjustable.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    descriptors: [StageDescriptor; 5],
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl StageCatalog {
    /// Builds the standard catalog.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            descriptors: [
                model_selection(),
                gene_tree(),
                ancestors(),
                reconcile(),
                bootstrap(),
            ],
        }
    }

    const fn slot(kind: StageKind) -> usize {
        match kind {
            StageKind::ModelSelection => 0,
            StageKind::GeneTree => 1,
            StageKind::Ancestors => 2,
            StageKind::Reconcile => 3,
            StageKind::Bootstrap => 4,
        }
    }

    /// Returns the descriptor for a kind.
    #[must_use]
    pub fn descriptor(&self, kind: StageKind) -> &StageDescriptor {
        &self.descriptors[Self::slot(kind)]
    }

    /// Returns a mutable descriptor for reconfiguration.
    pub fn descriptor_mut(&mut self, kind: StageKind) -> &mut StageDescriptor {
        &mut self.descriptors[Self::slot(kind)]
    }

    /// Replaces the output schema of one variant.
    ///
    /// Returns false if the kind has no variant with that tag.
    pub fn set_output_schema<I, S>(&mut self, kind: StageKind, tag: &str, outputs: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.descriptor_mut(kind).variant_mut(tag) {
            Some(variant) => {
                variant.output_schema = outputs.into_iter().map(Into::into).collect::<BTreeSet<_>>();
                true
            }
            None => false,
        }
    }
}

fn threads() -> ParamSpec {
    ParamSpec::new(
        "num_threads",
        ParamDomain::Threads,
        "threads handed to the engine; -1 uses every available core",
    )
    .with_default(json!(-1))
}

fn seed() -> ParamSpec {
    ParamSpec::new("seed", ParamDomain::Seed, "random seed for the engine; engine picks one if unset")
}

fn model_selection() -> StageDescriptor {
    StageDescriptor::new(StageKind::ModelSelection, false)
        .with_inputs([ALIGNMENT])
        .with_outputs([MODEL, MODEL_COMPARISON])
        .with_param(
            ParamSpec::new(
                "alignment",
                ParamDomain::InputFile {
                    artifact: ALIGNMENT.to_string(),
                },
                "alignment to select a substitution model for",
            )
            .required(),
        )
        .with_param(
            ParamSpec::new(
                "model_matrices",
                ParamDomain::ModelMatrices,
                "candidate substitution matrices",
            )
            .with_default(json!(SUPPORTED_MODEL_MATRICES)),
        )
        .with_param(seed())
        .with_param(threads())
}

fn gene_tree() -> StageDescriptor {
    StageDescriptor::new(StageKind::GeneTree, true)
        .with_inputs([ALIGNMENT, MODEL])
        .with_outputs([GENE_TREE])
        .with_param(seed())
        .with_param(threads())
}

fn ancestors() -> StageDescriptor {
    StageDescriptor::new(StageKind::Ancestors, true)
        .with_inputs([ALIGNMENT, MODEL, GENE_TREE])
        .with_outputs([ANCESTORS, ANCESTOR_TREE])
        .with_param(
            ParamSpec::new(
                "alt_cutoff",
                ParamDomain::Fraction,
                "posterior probability above which an alternate state is reported",
            )
            .with_default(json!(0.25)),
        )
        .with_param(threads())
}

fn reconcile() -> StageDescriptor {
    let outputs = [RECONCILED_TREE, RECONCILIATION];
    StageDescriptor::new(StageKind::Reconcile, true)
        .with_inputs([ALIGNMENT, MODEL, GENE_TREE])
        .with_outputs(outputs)
        .with_param(
            ParamSpec::new(
                "bootstrap",
                ParamDomain::Bool,
                "reconcile bootstrap replicates instead of the ML gene tree",
            )
            .with_default(json!(false)),
        )
        .with_param(
            ParamSpec::new(
                "allow_horizontal_transfer",
                ParamDomain::Bool,
                "include transfer events (UndatedDTL) rather than only duplication/loss (UndatedDL)",
            )
            .with_default(json!(true)),
        )
        .with_param(ParamSpec::new(
            "species_tree",
            ParamDomain::InputFile {
                artifact: SPECIES_TREE.to_string(),
            },
            "species tree to reconcile against; inferred by the engine if absent",
        ))
        .with_param(ParamSpec::new(
            "gene_tree",
            ParamDomain::InputFile {
                artifact: GENE_TREE.to_string(),
            },
            "gene tree to reconcile instead of the one in the predecessor's lineage",
        ))
        .with_param(ParamSpec::new(
            "reconciled_tree",
            ParamDomain::InputFile {
                artifact: RECONCILED_TREE.to_string(),
            },
            "ML reconciled tree the bootstrap replicates are summarised on",
        ))
        .with_param(threads())
        .with_flag_variant(
            "bootstrap",
            StageVariant::new("reconcile_bootstrap")
                .with_inputs([ALIGNMENT, MODEL, GENE_TREE, RECONCILED_TREE, BOOTSTRAP_REPLICATES])
                .with_outputs(outputs)
                .accepting([StageKind::Bootstrap]),
        )
}

fn bootstrap() -> StageDescriptor {
    StageDescriptor::new(StageKind::Bootstrap, true)
        .with_inputs([ALIGNMENT, MODEL, GENE_TREE])
        .with_outputs([BOOTSTRAP_REPLICATES, SUPPORT_TREE])
        .with_param(
            ParamSpec::new(
                "num_bootstraps",
                ParamDomain::Count { min: 1 },
                "number of bootstrap replicates",
            )
            .with_default(json!(100)),
        )
        .with_param(seed())
        .with_param(threads())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Params;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_kind_has_a_descriptor() {
        let catalog = StageCatalog::standard();
        for kind in StageKind::ALL {
            let descriptor = catalog.descriptor(kind);
            assert_eq!(descriptor.kind, kind);
            assert!(!descriptor.base_variant().output_schema.is_empty());
        }
        assert!(!catalog.descriptor(StageKind::ModelSelection).requires_predecessor);
        assert!(catalog.descriptor(StageKind::GeneTree).requires_predecessor);
    }

    #[test]
    fn test_bootstrap_reconciliation_shares_schema_by_default() {
        let catalog = StageCatalog::standard();
        let reconcile = catalog.descriptor(StageKind::Reconcile);
        let bootstrap = reconcile.variant("reconcile_bootstrap").unwrap();

        assert_eq!(bootstrap.output_schema, reconcile.base_variant().output_schema);
        assert!(bootstrap.required_inputs.contains(BOOTSTRAP_REPLICATES));
        assert!(bootstrap.required_inputs.contains(RECONCILED_TREE));
    }

    #[test]
    fn test_variant_schema_is_configurable() {
        let mut catalog = StageCatalog::standard();
        assert!(catalog.set_output_schema(
            StageKind::Reconcile,
            "reconcile_bootstrap",
            [RECONCILED_TREE, RECONCILIATION, "support-summary"],
        ));
        assert!(!catalog.set_output_schema(StageKind::Reconcile, "missing", [GENE_TREE]));

        let reconcile = catalog.descriptor(StageKind::Reconcile);
        assert_eq!(reconcile.variant("reconcile_bootstrap").unwrap().output_schema.len(), 3);
        assert_eq!(reconcile.base_variant().output_schema.len(), 2);
    }

    #[test]
    fn test_reconcile_tree_overrides() {
        let catalog = StageCatalog::standard();
        let reconcile = catalog.descriptor(StageKind::Reconcile);
        let overridden: Vec<_> = reconcile
            .accepts_params
            .iter()
            .filter_map(ParamSpec::input_artifact)
            .collect();
        assert_eq!(overridden, vec![SPECIES_TREE, GENE_TREE, RECONCILED_TREE]);
    }

    #[test]
    fn test_gene_tree_defaults() {
        let catalog = StageCatalog::standard();
        let params = catalog
            .descriptor(StageKind::GeneTree)
            .validate_params("01_gene-tree", &Params::new())
            .unwrap();
        assert!(params.get_i64("num_threads").unwrap() >= 1);
        assert!(params.get("seed").is_none());
    }

    #[test]
    fn test_model_selection_requires_alignment() {
        let catalog = StageCatalog::standard();
        let err = catalog
            .descriptor(StageKind::ModelSelection)
            .validate_params("00_find-model", &Params::new())
            .unwrap_err();
        assert_eq!(err.code(), "CALC-002-INVALID_PARAM");
    }
}
