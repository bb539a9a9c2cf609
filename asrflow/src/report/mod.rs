//! Static HTML report over a tree-bearing and an ancestor-bearing directory.
//!
//! The report stage only reads from the store. Its bundle is assembled in a
//! temporary sibling of the output location and renamed into place, so a
//! failed build never leaves a partial report behind.

use crate::core::CalcStatus;
use crate::errors::{PipelineError, PipelineResult};
use crate::events::names;
use crate::stages::artifacts::{ANCESTORS, GENE_TREE, RECONCILED_TREE};
use crate::store::{CalcDirectory, CalcStore};
use crate::utils::fs::copy_recursive;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tera::{Context, Tera};
use tracing::info;

/// Name used for the report stage in errors and events.
pub const REPORT_STAGE: &str = "report";

/// Entry point of a bundle.
pub const INDEX_FILE: &str = "index.html";

/// Machine-readable summary of a bundle.
pub const SUMMARY_FILE: &str = "report.json";

const DATA_DIR: &str = "data";

const INDEX_TEMPLATE: &str = include_str!("templates/index.html.tera");

/// One input directory as described in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    /// `tree` or `ancestors`.
    pub role: String,
    /// Calculation directory name.
    pub calc_dir: String,
    /// Stage kind that wrote it.
    pub kind: String,
    /// Variant tag.
    pub variant: String,
    /// Run id of the directory.
    pub run_id: String,
    /// Ancestor directory names, oldest first.
    pub lineage: Vec<String>,
    /// The artifact the section is built around.
    pub primary: String,
    /// Copied artifacts, as paths relative to the bundle root.
    pub artifacts: BTreeMap<String, String>,
    /// Parameters the stage ran with, rendered as text.
    pub params: BTreeMap<String, String>,
}

/// Contents of `report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// When the bundle was built.
    pub generated_at: String,
    /// The tree section followed by the ancestor section.
    pub sections: Vec<ReportSection>,
}

/// A built report.
#[derive(Debug, Clone)]
pub struct ReportBundle {
    /// Bundle directory.
    pub output_dir: PathBuf,
    /// Path of `index.html`.
    pub index: PathBuf,
    /// Copied artifacts keyed by `<calc_dir>/<artifact>`.
    pub artifacts: BTreeMap<String, PathBuf>,
    /// The summary written to `report.json`.
    pub summary: ReportSummary,
}

impl ReportBundle {
    /// Returns a `file://` URL for the entry page.
    #[must_use]
    pub fn index_url(&self) -> String {
        let absolute = self.index.canonicalize().unwrap_or_else(|_| self.index.clone());
        format!("file://{}", absolute.display())
    }
}

fn not_ready(name: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::PredecessorNotReady {
        stage: REPORT_STAGE.to_string(),
        predecessor: Some(name.to_string()),
        reason: reason.into(),
    }
}

fn complete_input(store: &CalcStore, name: &str) -> PipelineResult<CalcDirectory> {
    let dir = store
        .lookup(name)?
        .ok_or_else(|| not_ready(name, "does not exist"))?;
    if dir.status() != CalcStatus::Complete {
        return Err(not_ready(name, format!("status is {}", dir.status())));
    }
    Ok(dir)
}

/// Resolves `path` through its nearest existing ancestor, so paths that do
/// not exist yet compare correctly against canonical store paths.
fn resolve_output(path: &Path) -> PipelineResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| PipelineError::io("resolve working directory", e))?
            .join(path)
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Ok(rest.iter().rev().fold(canonical, |acc, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}

/// Rejects output locations that overlap the store.
fn check_output_location(store: &CalcStore, output_dir: &Path) -> PipelineResult<()> {
    let resolved = resolve_output(output_dir)?;
    let root = store.root();
    if resolved.starts_with(root) || root.starts_with(&resolved) {
        return Err(PipelineError::InvalidParameter {
            stage: REPORT_STAGE.to_string(),
            param: "output_dir".to_string(),
            reason: format!(
                "{} overlaps the calculation store at {}",
                output_dir.display(),
                root.display()
            ),
        });
    }
    Ok(())
}

fn section(
    role: &str,
    dir: &CalcDirectory,
    primary: &str,
    staging: &Path,
    copied: &mut BTreeMap<String, PathBuf>,
) -> PipelineResult<ReportSection> {
    let resolved = dir.resolved_artifacts();
    let mut sources: BTreeMap<&str, PathBuf> = dir
        .manifest()
        .artifacts
        .keys()
        .filter_map(|name| Some((name.as_str(), dir.artifact_path(name)?)))
        .collect();
    if let Some(path) = resolved.get(primary) {
        sources.entry(primary).or_insert_with(|| path.clone());
    }

    let mut artifacts = BTreeMap::new();
    for (name, source) in sources {
        let file_name = source
            .file_name()
            .map_or_else(|| name.into(), std::ffi::OsStr::to_os_string);
        let relative = Path::new(DATA_DIR).join(dir.name()).join(file_name);
        copy_recursive(&source, &staging.join(&relative))
            .map_err(|e| PipelineError::io(format!("copy {}", source.display()), e))?;

        let display = relative.to_string_lossy().replace('\\', "/");
        copied.insert(format!("{}/{name}", dir.name()), relative);
        artifacts.insert(name.to_string(), display);
    }

    Ok(ReportSection {
        role: role.to_string(),
        calc_dir: dir.name().to_string(),
        kind: dir.kind().to_string(),
        variant: dir.variant().to_string(),
        run_id: dir.run_id().to_string(),
        lineage: dir.lineage().to_vec(),
        primary: primary.to_string(),
        artifacts,
        params: dir
            .manifest()
            .params
            .iter()
            .map(|(name, value)| {
                let text = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                (name.clone(), text)
            })
            .collect(),
    })
}

fn render_index(summary: &ReportSummary) -> PipelineResult<String> {
    let context = Context::from_serialize(summary).map_err(|e| PipelineError::Render(e.to_string()))?;
    Tera::one_off(INDEX_TEMPLATE, &context, true).map_err(|e| PipelineError::Render(e.to_string()))
}

/// Builds the report bundle for a tree directory and an ancestor directory.
///
/// The tree directory must expose a `reconciled-tree` or `gene-tree`
/// artifact and the ancestor directory an `ancestors` artifact.
///
/// # Errors
///
/// - `PredecessorNotReady` if an input is missing, not complete, or lacks
///   the artifact the report needs
/// - `InvalidParameter` if `output_dir` is inside the store or contains it
/// - `OutputExists` if `output_dir` exists and `overwrite` is false
/// - `Render` or IO errors while building the bundle
pub fn build_report(
    store: &CalcStore,
    tree_dir: &str,
    ancestor_dir: &str,
    output_dir: &Path,
    overwrite: bool,
) -> PipelineResult<ReportBundle> {
    let tree = complete_input(store, tree_dir)?;
    let ancestors = complete_input(store, ancestor_dir)?;

    let tree_view = tree.resolved_artifacts();
    let tree_artifact = [RECONCILED_TREE, GENE_TREE]
        .into_iter()
        .find(|name| tree_view.contains_key(*name))
        .ok_or_else(|| not_ready(tree_dir, "no reconciled-tree or gene-tree artifact"))?;
    if !ancestors.resolved_artifacts().contains_key(ANCESTORS) {
        return Err(not_ready(ancestor_dir, "no ancestors artifact"));
    }

    check_output_location(store, output_dir)?;
    if output_dir.exists() && !overwrite {
        return Err(PipelineError::OutputExists {
            stage: REPORT_STAGE.to_string(),
            path: output_dir.to_path_buf(),
        });
    }

    let parent = match output_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .map_err(|e| PipelineError::io(format!("create {}", parent.display()), e))?;
    let staging = tempfile::Builder::new()
        .prefix(".report-")
        .tempdir_in(&parent)
        .map_err(|e| PipelineError::io("create report staging directory", e))?;

    let mut copied = BTreeMap::new();
    let summary = ReportSummary {
        generated_at: iso_timestamp(),
        sections: vec![
            section("tree", &tree, tree_artifact, staging.path(), &mut copied)?,
            section("ancestors", &ancestors, ANCESTORS, staging.path(), &mut copied)?,
        ],
    };

    crate::utils::fs::write_json_atomic(&staging.path().join(SUMMARY_FILE), &summary)
        .map_err(|e| PipelineError::io("write report summary", e))?;
    let html = render_index(&summary)?;
    fs::write(staging.path().join(INDEX_FILE), html)
        .map_err(|e| PipelineError::io("write report index", e))?;

    if output_dir.exists() {
        let removed = if output_dir.is_dir() {
            fs::remove_dir_all(output_dir)
        } else {
            fs::remove_file(output_dir)
        };
        removed.map_err(|e| PipelineError::io(format!("replace {}", output_dir.display()), e))?;
    }
    fs::rename(staging.path(), output_dir)
        .map_err(|e| PipelineError::io(format!("move report into {}", output_dir.display()), e))?;

    let bundle = ReportBundle {
        output_dir: output_dir.to_path_buf(),
        index: output_dir.join(INDEX_FILE),
        artifacts: copied
            .into_iter()
            .map(|(key, relative)| (key, output_dir.join(relative)))
            .collect(),
        summary,
    };

    info!(
        output = %bundle.output_dir.display(),
        tree = %tree_dir,
        ancestors = %ancestor_dir,
        "Report built"
    );
    store.events().try_emit(
        names::REPORT_BUILT,
        Some(json!({
            "output": bundle.output_dir,
            "tree": tree_dir,
            "ancestors": ancestor_dir,
            "artifacts": bundle.artifacts.len(),
        })),
    );

    Ok(bundle)
}

/// Reads `report.json` back from a bundle.
///
/// # Errors
///
/// Returns an IO or serialization error.
pub fn read_summary(output_dir: &Path) -> PipelineResult<ReportSummary> {
    let path = output_dir.join(SUMMARY_FILE);
    let body = fs::read(&path).map_err(|e| PipelineError::io(format!("read {}", path.display()), e))?;
    Ok(serde_json::from_slice(&body)?)
}
