//! Pipeline configuration.
//!
//! Loaded from a JSON file; a handful of environment variables override the
//! file so the same chain can be pointed at another store without editing it.
//!
//! ```json
//! {
//!   "store_root": "calculations",
//!   "default_threads": 8,
//!   "engines": {
//!     "model_selection": {"program": "asr-engine", "args": ["model"]},
//!     "gene_tree": {"program": "asr-engine", "args": ["tree"]}
//!   }
//! }
//! ```

use crate::core::StageKind;
use crate::engines::{CommandEngine, Engine, EngineSet};
use crate::errors::{PipelineError, PipelineResult};
use crate::stages::{StageCatalog, StageInvocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Overrides `store_root`.
pub const ENV_ROOT: &str = "ASRFLOW_ROOT";
/// Overrides `log_json` (`1`/`true`/`yes` enable it).
pub const ENV_LOG_JSON: &str = "ASRFLOW_LOG_JSON";
/// Overrides `default_threads`.
pub const ENV_THREADS: &str = "ASRFLOW_THREADS";

fn default_store_root() -> PathBuf {
    PathBuf::from("calculations")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How to launch the engine for one stage kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run.
    pub program: PathBuf,
    /// Arguments placed before the request path.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root directory of the calculation store.
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    /// Thread count applied to stages that do not set `num_threads`.
    #[serde(default)]
    pub default_threads: Option<i64>,
    /// Default tracing filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub log_json: bool,
    /// Engine commands keyed by stage kind.
    #[serde(default)]
    pub engines: BTreeMap<StageKind, CommandSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            default_threads: None,
            log_level: default_log_level(),
            log_json: false,
            engines: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Loads the file at `path`, or the defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&body)
            .map_err(|e| PipelineError::Config(format!("invalid {}: {e}", path.display())))?;
        debug!(path = %path.display(), engines = config.engines.len(), "Loaded configuration");
        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unparseable values.
    pub fn apply_env(&mut self) -> PipelineResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unparseable values.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> PipelineResult<()> {
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.store_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup(ENV_LOG_JSON) {
            self.log_json = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = lookup(ENV_THREADS) {
            let threads = raw
                .trim()
                .parse::<i64>()
                .map_err(|e| PipelineError::Config(format!("{ENV_THREADS}={raw}: {e}")))?;
            self.default_threads = Some(threads);
        }
        Ok(())
    }

    /// Builds command engines for every stage kind.
    ///
    /// # Errors
    ///
    /// Returns `Config` if any kind has no engine configured.
    pub fn engine_set(&self) -> PipelineResult<EngineSet> {
        let engine = |kind: StageKind| -> PipelineResult<Arc<dyn Engine>> {
            let spec = self.engines.get(&kind).ok_or_else(|| {
                PipelineError::Config(format!("no engine configured for {kind}"))
            })?;
            let mut engine = CommandEngine::new(kind.as_str(), spec.program.clone()).with_args(spec.args.clone());
            for (key, value) in &spec.env {
                engine = engine.with_env(key.clone(), value.clone());
            }
            Ok(Arc::new(engine))
        };

        Ok(EngineSet::new(
            engine(StageKind::ModelSelection)?,
            engine(StageKind::GeneTree)?,
            engine(StageKind::Ancestors)?,
            engine(StageKind::Reconcile)?,
            engine(StageKind::Bootstrap)?,
        ))
    }

    /// Fills configured defaults into an invocation that left them unset.
    pub fn apply_defaults(&self, catalog: &StageCatalog, invocation: &mut StageInvocation) {
        let Some(threads) = self.default_threads else {
            return;
        };
        let accepts_threads = catalog
            .descriptor(invocation.kind)
            .accepts_params
            .iter()
            .any(|spec| spec.name == "num_threads");
        if accepts_threads {
            invocation
                .params
                .entry("num_threads".to_string())
                .or_insert_with(|| threads.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_no_file() {
        let config = PipelineConfig::load(None).unwrap();
        assert_eq!(config.store_root, PathBuf::from("calculations"));
        assert_eq!(config.log_level, "info");
        assert!(config.engines.is_empty());
    }

    #[test]
    fn test_load_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asrflow.json");
        std::fs::write(
            &path,
            json!({
                "default_threads": 4,
                "engines": {"gene_tree": {"program": "raxml-wrapper", "args": ["--fast"]}}
            })
            .to_string(),
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.default_threads, Some(4));
        assert_eq!(config.engines[&StageKind::GeneTree].args, vec!["--fast"]);
        assert_eq!(config.store_root, PathBuf::from("calculations"));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(PipelineConfig::load(Some(&path)), Err(PipelineError::Config(_))));
        assert!(matches!(
            PipelineConfig::load(Some(&dir.path().join("missing.json"))),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            (ENV_ROOT, "/scratch/asr"),
            (ENV_LOG_JSON, "TRUE"),
            (ENV_THREADS, "-1"),
        ]);
        let mut config = PipelineConfig::default();
        config
            .apply_overrides_from(|key| env.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.store_root, PathBuf::from("/scratch/asr"));
        assert!(config.log_json);
        assert_eq!(config.default_threads, Some(-1));

        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides_from(|key| (key == ENV_THREADS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_engine_set_requires_every_kind() {
        let mut config = PipelineConfig::default();
        let err = config.engine_set().unwrap_err();
        assert!(err.to_string().contains("model_selection"));

        for kind in StageKind::ALL {
            config.engines.insert(
                kind,
                CommandSpec {
                    program: PathBuf::from("asr-engine"),
                    args: vec![kind.as_str().to_string()],
                    env: BTreeMap::new(),
                },
            );
        }
        let set = config.engine_set().unwrap();
        assert_eq!(set.engine_for(StageKind::Bootstrap).name(), "bootstrap");
    }

    #[test]
    fn test_apply_defaults_keeps_explicit_threads() {
        let config = PipelineConfig {
            default_threads: Some(6),
            ..PipelineConfig::default()
        };
        let catalog = StageCatalog::standard();

        let mut implicit = StageInvocation::new(StageKind::GeneTree, "01_gene-tree");
        config.apply_defaults(&catalog, &mut implicit);
        assert_eq!(implicit.params["num_threads"], json!(6));

        let mut explicit =
            StageInvocation::new(StageKind::GeneTree, "01_gene-tree").with_param("num_threads", json!(2));
        config.apply_defaults(&catalog, &mut explicit);
        assert_eq!(explicit.params["num_threads"], json!(2));
    }
}
