//! Static stage metadata.

use crate::core::{ParamSpec, Params, ResolvedParams, StageKind};
use crate::errors::{PipelineError, PipelineResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Schema of one stage variant.
///
/// Most kinds have a single variant; a kind may switch to another variant
/// when a boolean parameter is set (reconciliation with `bootstrap=true`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageVariant {
    /// Tag recorded in the manifest (e.g. `reconcile_bootstrap`).
    pub tag: String,
    /// Artifacts a successful run must produce.
    pub output_schema: BTreeSet<String>,
    /// Artifacts that must be resolvable from the predecessor lineage or overrides.
    pub required_inputs: BTreeSet<String>,
    /// Predecessor kinds accepted; `None` accepts any kind.
    pub accepted_predecessors: Option<BTreeSet<StageKind>>,
}

impl StageVariant {
    /// Creates a variant with no outputs or inputs.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            output_schema: BTreeSet::new(),
            required_inputs: BTreeSet::new(),
            accepted_predecessors: None,
        }
    }

    /// Sets the output schema.
    #[must_use]
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_schema = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the required inputs.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the predecessor kinds.
    #[must_use]
    pub fn accepting(mut self, kinds: impl IntoIterator<Item = StageKind>) -> Self {
        self.accepted_predecessors = Some(kinds.into_iter().collect());
        self
    }

    /// Returns true if a predecessor of `kind` may feed this variant.
    #[must_use]
    pub fn accepts_predecessor(&self, kind: StageKind) -> bool {
        self.accepted_predecessors
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Immutable description of a stage kind.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Unique stage name.
    pub name: String,
    /// The engine-backed kind.
    pub kind: StageKind,
    /// Whether a complete predecessor directory is mandatory.
    pub requires_predecessor: bool,
    /// Parameters the stage recognises.
    pub accepts_params: Vec<ParamSpec>,
    base: StageVariant,
    flagged: Vec<(String, StageVariant)>,
}

impl StageDescriptor {
    /// Creates a descriptor whose base variant is tagged with the kind name.
    #[must_use]
    pub fn new(kind: StageKind, requires_predecessor: bool) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            requires_predecessor,
            accepts_params: Vec::new(),
            base: StageVariant::new(kind.as_str()),
            flagged: Vec::new(),
        }
    }

    /// Replaces the base variant's outputs.
    #[must_use]
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = self.base.with_outputs(outputs);
        self
    }

    /// Replaces the base variant's required inputs.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = self.base.with_inputs(inputs);
        self
    }

    /// Adds an accepted parameter.
    #[must_use]
    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.accepts_params.push(spec);
        self
    }

    /// Adds a variant selected when the boolean parameter `flag` is true.
    #[must_use]
    pub fn with_flag_variant(mut self, flag: impl Into<String>, variant: StageVariant) -> Self {
        self.flagged.push((flag.into(), variant));
        self
    }

    /// Returns the base variant.
    #[must_use]
    pub fn base_variant(&self) -> &StageVariant {
        &self.base
    }

    /// Returns every variant, base first.
    pub fn variants(&self) -> impl Iterator<Item = &StageVariant> {
        std::iter::once(&self.base).chain(self.flagged.iter().map(|(_, v)| v))
    }

    /// Looks up a variant by tag for reconfiguration.
    pub fn variant_mut(&mut self, tag: &str) -> Option<&mut StageVariant> {
        if self.base.tag == tag {
            return Some(&mut self.base);
        }
        self.flagged
            .iter_mut()
            .map(|(_, variant)| variant)
            .find(|variant| variant.tag == tag)
    }

    /// Looks up a variant by tag.
    #[must_use]
    pub fn variant(&self, tag: &str) -> Option<&StageVariant> {
        self.variants().find(|variant| variant.tag == tag)
    }

    /// Selects the variant for a validated parameter set.
    #[must_use]
    pub fn variant_for(&self, params: &ResolvedParams) -> &StageVariant {
        self.flagged
            .iter()
            .find(|(flag, _)| params.flag(flag))
            .map_or(&self.base, |(_, variant)| variant)
    }

    /// Returns the names of all accepted parameters.
    #[must_use]
    pub fn param_names(&self) -> Vec<String> {
        self.accepts_params.iter().map(|p| p.name.clone()).collect()
    }

    /// Validates raw parameters for the stage writing `calc_dir`.
    ///
    /// Unknown names are reported before any domain check, so a typo is
    /// never masked by a missing required parameter.
    ///
    /// # Errors
    ///
    /// Returns `UnknownParameter` or `InvalidParameter`.
    pub fn validate_params(&self, calc_dir: &str, raw: &Params) -> PipelineResult<ResolvedParams> {
        if let Some(unknown) = raw
            .keys()
            .find(|name| !self.accepts_params.iter().any(|spec| &spec.name == *name))
        {
            return Err(PipelineError::UnknownParameter {
                stage: calc_dir.to_string(),
                param: unknown.clone(),
                accepted: self.param_names(),
            });
        }

        let mut resolved = BTreeMap::new();
        for spec in &self.accepts_params {
            let value = match (raw.get(&spec.name), &spec.default) {
                (Some(serde_json::Value::Null), _) | (None, _) if spec.required => {
                    return Err(PipelineError::InvalidParameter {
                        stage: calc_dir.to_string(),
                        param: spec.name.clone(),
                        reason: format!("required: {}", spec.effect),
                    });
                }
                (Some(serde_json::Value::Null) | None, Some(default)) => default,
                (Some(serde_json::Value::Null) | None, None) => continue,
                (Some(value), _) => value,
            };
            resolved.insert(spec.name.clone(), spec.normalize(calc_dir, value)?);
        }

        Ok(ResolvedParams::from_map(resolved))
    }

    /// Returns the input artifacts replaced by file parameters, keyed by artifact name.
    #[must_use]
    pub fn input_overrides(&self, params: &ResolvedParams) -> BTreeMap<String, PathBuf> {
        self.accepts_params
            .iter()
            .filter_map(|spec| {
                let artifact = spec.input_artifact()?;
                let path = params.get_path(&spec.name)?;
                Some((artifact.to_string(), path))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ParamDomain;
    use serde_json::json;

    fn descriptor() -> StageDescriptor {
        StageDescriptor::new(StageKind::Reconcile, true)
            .with_outputs(["reconciled-tree"])
            .with_inputs(["gene-tree"])
            .with_param(
                ParamSpec::new("bootstrap", ParamDomain::Bool, "bootstrap variant")
                    .with_default(json!(false)),
            )
            .with_param(ParamSpec::new("seed", ParamDomain::Seed, "seed"))
            .with_flag_variant(
                "bootstrap",
                StageVariant::new("reconcile_bootstrap")
                    .with_outputs(["reconciled-tree"])
                    .with_inputs(["gene-tree", "bootstrap-replicates"])
                    .accepting([StageKind::Bootstrap]),
            )
    }

    #[test]
    fn test_unknown_parameter_lists_accepted() {
        let mut raw = Params::new();
        raw.insert("bootstrapp".to_string(), json!(true));

        let err = descriptor().validate_params("rec", &raw).unwrap_err();
        match err {
            PipelineError::UnknownParameter { param, accepted, .. } => {
                assert_eq!(param, "bootstrapp");
                assert_eq!(accepted, vec!["bootstrap", "seed"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults_fill_and_optional_skip() {
        let params = descriptor().validate_params("rec", &Params::new()).unwrap();
        assert_eq!(params.get("bootstrap"), Some(&json!(false)));
        assert!(params.get("seed").is_none());
    }

    #[test]
    fn test_required_parameter_missing() {
        let descriptor = StageDescriptor::new(StageKind::ModelSelection, false).with_param(
            ParamSpec::new("alignment", ParamDomain::Seed, "input alignment").required(),
        );
        let err = descriptor.validate_params("ms", &Params::new()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { .. }));
    }

    #[test]
    fn test_variant_selection_by_flag() {
        let descriptor = descriptor();
        let mut raw = Params::new();
        raw.insert("bootstrap".to_string(), json!(true));
        let params = descriptor.validate_params("rec", &raw).unwrap();

        let variant = descriptor.variant_for(&params);
        assert_eq!(variant.tag, "reconcile_bootstrap");
        assert!(variant.accepts_predecessor(StageKind::Bootstrap));
        assert!(!variant.accepts_predecessor(StageKind::Ancestors));

        let plain = descriptor
            .validate_params("rec", &Params::new())
            .unwrap();
        assert_eq!(descriptor.variant_for(&plain).tag, "reconcile");
        assert!(descriptor.base_variant().accepts_predecessor(StageKind::Ancestors));
    }

    #[test]
    fn test_variant_mut_reconfigures_schema() {
        let mut descriptor = descriptor();
        descriptor
            .variant_mut("reconcile_bootstrap")
            .unwrap()
            .output_schema
            .insert("support-summary".to_string());

        let variant = descriptor.variant("reconcile_bootstrap").unwrap();
        assert!(variant.output_schema.contains("support-summary"));
        assert!(!descriptor.base_variant().output_schema.contains("support-summary"));
        assert!(descriptor.variant_mut("nope").is_none());
    }
}
