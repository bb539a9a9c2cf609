//! Stage parameter domains and validation.
//!
//! Each stage declares the options it accepts as [`ParamSpec`]s. Raw
//! parameters from a chain file are checked against those specs before any
//! directory is touched, and come out as a [`ResolvedParams`] with defaults
//! filled in and values normalised.

use crate::errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Raw, unvalidated stage parameters.
pub type Params = BTreeMap<String, Value>;

/// Protein substitution matrices the model selector can evaluate.
pub const SUPPORTED_MODEL_MATRICES: &[&str] = &[
    "cpREV", "Dayhoff", "DCMut", "DEN", "FLU", "HIVb", "HIVw", "JTT", "JTT-DCMut", "LG",
    "LG4M", "LG4X", "mtART", "mtMAM", "mtREV", "mtZOA", "PMB", "PROTGTR", "rtREV", "stmtREV",
    "VT", "WAG",
];

/// The domain of values a parameter accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamDomain {
    /// `true` or `false`.
    Bool,
    /// Thread count: an integer >= 1, or -1 for every available core.
    Threads,
    /// Random seed: a non-negative integer.
    Seed,
    /// Integer with a lower bound.
    Count {
        /// Smallest accepted value.
        min: i64,
    },
    /// Number in `[0, 1]`.
    Fraction,
    /// Non-empty list of supported substitution matrix names.
    ModelMatrices,
    /// Existing, non-empty file that replaces the named input artifact.
    InputFile {
        /// The input artifact this file provides.
        artifact: String,
    },
}

/// A parameter a stage accepts.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Parameter name as it appears in chain files.
    pub name: String,
    /// Accepted values.
    pub domain: ParamDomain,
    /// Value used when the caller omits the parameter.
    pub default: Option<Value>,
    /// Whether the caller must supply the parameter.
    pub required: bool,
    /// What the parameter does.
    pub effect: String,
}

impl ParamSpec {
    /// Creates an optional parameter with no default.
    #[must_use]
    pub fn new(name: impl Into<String>, domain: ParamDomain, effect: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain,
            default: None,
            required: false,
            effect: effect.into(),
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Marks the parameter as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Returns the input artifact this parameter overrides, if any.
    #[must_use]
    pub fn input_artifact(&self) -> Option<&str> {
        match &self.domain {
            ParamDomain::InputFile { artifact } => Some(artifact),
            _ => None,
        }
    }

    /// Checks a value against the domain and returns its normalised form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the value is outside the domain.
    pub fn normalize(&self, stage: &str, value: &Value) -> PipelineResult<Value> {
        let invalid = |reason: String| PipelineError::InvalidParameter {
            stage: stage.to_string(),
            param: self.name.clone(),
            reason,
        };

        match &self.domain {
            ParamDomain::Bool => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| invalid(format!("expected a boolean, got {value}"))),
            ParamDomain::Threads => {
                let threads = value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?;
                match threads {
                    -1 => Ok(Value::from(available_threads())),
                    n if n >= 1 => Ok(Value::from(n)),
                    n => Err(invalid(format!(
                        "thread count must be >= 1 (or -1 for all available), got {n}"
                    ))),
                }
            }
            ParamDomain::Seed => value
                .as_u64()
                .map(Value::from)
                .ok_or_else(|| invalid(format!("expected a non-negative integer, got {value}"))),
            ParamDomain::Count { min } => {
                let count = value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?;
                if count < *min {
                    return Err(invalid(format!("must be >= {min}, got {count}")));
                }
                Ok(Value::from(count))
            }
            ParamDomain::Fraction => {
                let fraction = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(invalid(format!("must be between 0 and 1, got {fraction}")));
                }
                Ok(Value::from(fraction))
            }
            ParamDomain::ModelMatrices => normalize_matrices(value).map_err(invalid),
            ParamDomain::InputFile { .. } => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| invalid(format!("expected a file path, got {value}")))?;
                check_input_file(Path::new(raw)).map_err(invalid)?;
                Ok(Value::String(raw.to_string()))
            }
        }
    }
}

fn available_threads() -> i64 {
    std::thread::available_parallelism()
        .map(|n| i64::try_from(n.get()).unwrap_or(i64::MAX))
        .unwrap_or(1)
}

fn normalize_matrices(value: &Value) -> Result<Value, String> {
    let names: Vec<&str> = match value {
        Value::String(single) => single.split(',').map(str::trim).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().ok_or_else(|| format!("expected a matrix name, got {item}")))
            .collect::<Result<_, _>>()?,
        other => return Err(format!("expected a list of matrix names, got {other}")),
    };

    if names.iter().all(|name| name.is_empty()) {
        return Err("at least one model matrix is required".to_string());
    }

    let mut canonical = Vec::with_capacity(names.len());
    for name in names.into_iter().filter(|name| !name.is_empty()) {
        let found = SUPPORTED_MODEL_MATRICES
            .iter()
            .find(|supported| supported.eq_ignore_ascii_case(name))
            .ok_or_else(|| format!("unsupported model matrix '{name}'"))?;
        if !canonical.contains(found) {
            canonical.push(*found);
        }
    }

    Ok(Value::from(canonical))
}

fn check_input_file(path: &Path) -> Result<(), String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
    if !metadata.is_file() {
        return Err(format!("'{}' is not a file", path.display()));
    }
    if metadata.len() == 0 {
        return Err(format!("'{}' is empty", path.display()));
    }
    Ok(())
}

/// Parameters that passed validation, with defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedParams(BTreeMap<String, Value>);

impl ResolvedParams {
    /// Wraps an already-validated map.
    #[must_use]
    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }

    /// Gets a raw value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Gets a boolean value, `false` when absent.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Gets an integer value.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    /// Gets a path value.
    #[must_use]
    pub fn get_path(&self, name: &str) -> Option<PathBuf> {
        self.0.get(name).and_then(Value::as_str).map(PathBuf::from)
    }

    /// Iterates over name/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.0
    }
}
