//! Error types for the asrflow pipeline core.
//!
//! Every failure a stage can raise is a variant of [`PipelineError`]. Each
//! variant carries the calculation directory name of the failing stage so the
//! caller always knows where a chain stopped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure signal returned by an external engine.
///
/// The diagnostic is the engine's own payload and is never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFailure {
    /// Process exit code, when the engine is a subprocess that ran.
    pub exit_code: Option<i32>,
    /// Raw diagnostic text from the engine.
    pub diagnostic: String,
}

impl EngineFailure {
    /// Creates a failure with no exit code.
    #[must_use]
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            diagnostic: diagnostic.into(),
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit code {code}: {}", self.diagnostic),
            None => write!(f, "{}", self.diagnostic),
        }
    }
}

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A parameter name is not recognised by the stage.
    #[error("Stage '{stage}': unknown parameter '{param}' (accepted: {})", .accepted.join(", "))]
    UnknownParameter {
        /// Calculation directory of the failing stage.
        stage: String,
        /// The offending parameter name.
        param: String,
        /// Parameter names the stage accepts.
        accepted: Vec<String>,
    },

    /// A parameter value is outside its declared domain, or a required one is missing.
    #[error("Stage '{stage}': invalid parameter '{param}': {reason}")]
    InvalidParameter {
        /// Calculation directory of the failing stage.
        stage: String,
        /// The offending parameter name.
        param: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The declared predecessor cannot be consumed.
    #[error("Stage '{stage}': predecessor {} not ready: {reason}", display_predecessor(.predecessor))]
    PredecessorNotReady {
        /// Calculation directory of the failing stage.
        stage: String,
        /// The predecessor name, if one was declared.
        predecessor: Option<String>,
        /// Why it cannot be used.
        reason: String,
    },

    /// The target calculation directory exists and may not be replaced.
    #[error("Calculation directory '{stage}' already exists: {reason}")]
    AlreadyExists {
        /// Calculation directory name.
        stage: String,
        /// Why the directory cannot be acquired.
        reason: String,
    },

    /// A report output location exists and overwrite was not requested.
    #[error("Stage '{stage}': output '{}' already exists", .path.display())]
    OutputExists {
        /// Stage producing the output.
        stage: String,
        /// The existing output path.
        path: PathBuf,
    },

    /// The engine succeeded but did not produce every declared artifact.
    #[error("Stage '{stage}': incomplete artifacts, missing {}", .missing.join(", "))]
    IncompleteArtifacts {
        /// Calculation directory of the failing stage.
        stage: String,
        /// Artifact names that were absent or empty.
        missing: Vec<String>,
    },

    /// The external engine reported failure.
    #[error("Stage '{stage}': engine execution failed: {failure}")]
    EngineExecutionFailed {
        /// Calculation directory of the failing stage.
        stage: String,
        /// The engine's own diagnostic.
        failure: EngineFailure,
    },

    /// A directory was left in progress by an interrupted run.
    #[error("Calculation directory '{stage}' is a stale in-progress run; resume or discard it first")]
    StaleInProgress {
        /// Calculation directory name.
        stage: String,
    },

    /// A stage would consume its own output, directly or transitively.
    #[error("Stage '{stage}': cycle detected: {}", .cycle_path.join(" -> "))]
    CycleDetected {
        /// Calculation directory of the failing stage.
        stage: String,
        /// The names forming the cycle.
        cycle_path: Vec<String>,
    },

    /// A directory is still needed by an executing chain.
    #[error("Calculation directory '{stage}' is in use: {reason}")]
    DirectoryInUse {
        /// Calculation directory name.
        stage: String,
        /// Who still needs it.
        reason: String,
    },

    /// The declared chain is malformed.
    #[error("Invalid chain: {reason}")]
    InvalidChain {
        /// What is wrong with the chain.
        reason: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Report rendering failed.
    #[error("Render error: {0}")]
    Render(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error with the path or operation that caused it.
    #[error("IO error ({context}): {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn display_predecessor(predecessor: &Option<String>) -> String {
    predecessor
        .as_deref()
        .map_or_else(|| "<none>".to_string(), |name| format!("'{name}'"))
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl PipelineError {
    /// Wraps an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns the stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownParameter { .. } => "CALC-001-UNKNOWN_PARAM",
            Self::InvalidParameter { .. } => "CALC-002-INVALID_PARAM",
            Self::PredecessorNotReady { .. } => "CALC-003-PREDECESSOR",
            Self::AlreadyExists { .. } => "CALC-004-EXISTS",
            Self::OutputExists { .. } => "CALC-005-OUTPUT_EXISTS",
            Self::IncompleteArtifacts { .. } => "CALC-006-INCOMPLETE",
            Self::EngineExecutionFailed { .. } => "CALC-007-ENGINE",
            Self::StaleInProgress { .. } => "CALC-008-STALE",
            Self::CycleDetected { .. } => "CALC-009-CYCLE",
            Self::DirectoryInUse { .. } => "CALC-010-IN_USE",
            Self::InvalidChain { .. } => "CALC-011-CHAIN",
            Self::Config(_) => "CALC-012-CONFIG",
            Self::Render(_) => "CALC-013-RENDER",
            Self::Serialization(_) => "CALC-014-SERDE",
            Self::Io { .. } => "CALC-015-IO",
        }
    }

    /// Returns the calculation directory name the error belongs to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::UnknownParameter { stage, .. }
            | Self::InvalidParameter { stage, .. }
            | Self::PredecessorNotReady { stage, .. }
            | Self::AlreadyExists { stage, .. }
            | Self::OutputExists { stage, .. }
            | Self::IncompleteArtifacts { stage, .. }
            | Self::EngineExecutionFailed { stage, .. }
            | Self::StaleInProgress { stage }
            | Self::CycleDetected { stage, .. }
            | Self::DirectoryInUse { stage, .. } => Some(stage),
            Self::InvalidChain { .. }
            | Self::Config(_)
            | Self::Render(_)
            | Self::Serialization(_)
            | Self::Io { .. } => None,
        }
    }

    /// Returns true for errors raised before any engine was invoked.
    ///
    /// These leave every calculation directory untouched.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::PredecessorNotReady { .. }
                | Self::AlreadyExists { .. }
                | Self::OutputExists { .. }
                | Self::StaleInProgress { .. }
                | Self::CycleDetected { .. }
                | Self::DirectoryInUse { .. }
                | Self::InvalidChain { .. }
        )
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(stage) = self.stage() {
            map.insert("stage".to_string(), serde_json::json!(stage));
        }

        match self {
            Self::IncompleteArtifacts { missing, .. } => {
                map.insert("missing".to_string(), serde_json::json!(missing));
            }
            Self::EngineExecutionFailed { failure, .. } => {
                map.insert("exit_code".to_string(), serde_json::json!(failure.exit_code));
                map.insert("diagnostic".to_string(), serde_json::json!(failure.diagnostic));
            }
            Self::CycleDetected { cycle_path, .. } => {
                map.insert("cycle_path".to_string(), serde_json::json!(cycle_path));
            }
            _ => {}
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_parameter_message_lists_accepted() {
        let err = PipelineError::UnknownParameter {
            stage: "01_gene-tree".to_string(),
            param: "thread".to_string(),
            accepted: vec!["num_threads".to_string(), "seed".to_string()],
        };

        let msg = err.to_string();
        assert!(msg.contains("01_gene-tree"));
        assert!(msg.contains("num_threads, seed"));
        assert_eq!(err.code(), "CALC-001-UNKNOWN_PARAM");
    }

    #[test]
    fn test_engine_failure_keeps_diagnostic() {
        let failure = EngineFailure::new("raxml-ng: alignment has 0 sites").with_exit_code(2);
        let err = PipelineError::EngineExecutionFailed {
            stage: "gene-tree".to_string(),
            failure: failure.clone(),
        };

        let dict = err.to_dict();
        assert_eq!(dict.get("diagnostic").unwrap(), "raxml-ng: alignment has 0 sites");
        assert_eq!(dict.get("exit_code").unwrap(), 2);
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_predecessor_message_without_name() {
        let err = PipelineError::PredecessorNotReady {
            stage: "ancestors".to_string(),
            predecessor: None,
            reason: "no predecessor declared".to_string(),
        };
        assert!(err.to_string().contains("<none>"));
    }

    #[test]
    fn test_validation_classification() {
        let stale = PipelineError::StaleInProgress {
            stage: "x".to_string(),
        };
        let incomplete = PipelineError::IncompleteArtifacts {
            stage: "x".to_string(),
            missing: vec!["gene-tree".to_string()],
        };

        assert!(stale.is_validation());
        assert!(!incomplete.is_validation());
        assert_eq!(incomplete.stage(), Some("x"));
    }
}
