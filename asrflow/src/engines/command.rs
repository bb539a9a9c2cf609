//! Engines run as external programs.

use super::{Engine, EngineRequest};
use crate::core::ArtifactSet;
use crate::errors::EngineFailure;
use crate::utils::fs::write_json_atomic;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// File the request is written to inside the calculation directory.
pub const REQUEST_FILE: &str = "request.json";

#[derive(Debug, Deserialize)]
struct CommandOutput {
    artifacts: ArtifactSet,
}

/// Runs a program once per stage.
///
/// The program is started in the calculation directory with the path of
/// `request.json` appended to its arguments. On success it prints
/// `{"artifacts": {"<name>": "<path>"}}` to stdout; relative paths are
/// resolved against the output directory.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandEngine {
    /// Creates an engine running `program`.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Adds leading arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child process.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl Engine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &EngineRequest) -> Result<ArtifactSet, EngineFailure> {
        let request_path = request.calc_dir.join(REQUEST_FILE);
        write_json_atomic(&request_path, request).map_err(|e| {
            EngineFailure::new(format!("could not write {}: {e}", request_path.display()))
        })?;

        info!(
            engine = %self.name,
            program = %self.program.display(),
            calc_dir = %request.stage,
            "Launching engine"
        );

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&request_path)
            .envs(&self.env)
            .current_dir(&request.calc_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EngineFailure::new(format!("could not launch {}: {e}", self.program.display()))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let failure = EngineFailure::new(stderr);
            return Err(match output.status.code() {
                Some(code) => failure.with_exit_code(code),
                None => failure,
            });
        }

        debug!(engine = %self.name, stderr_bytes = stderr.len(), "Engine exited cleanly");

        let parsed: CommandOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            EngineFailure::new(format!(
                "malformed engine output ({e}): {}",
                String::from_utf8_lossy(&output.stdout)
            ))
        })?;

        Ok(parsed
            .artifacts
            .into_iter()
            .map(|(name, path)| {
                let path = if path.is_absolute() {
                    path
                } else {
                    request.output_dir.join(path)
                };
                (name, path)
            })
            .collect())
    }
}
