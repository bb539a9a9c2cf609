//! Calculation directory name rules.

use crate::errors::{PipelineError, PipelineResult};
use regex::Regex;
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("calc dir pattern is valid")
    })
}

/// Validates that a calculation directory name is a single safe path segment.
///
/// Names like `00_find-model` or `reconcile.bs` pass; anything containing a
/// path separator, starting with a dot, or empty is rejected.
///
/// # Errors
///
/// Returns `InvalidParameter` on the `calc_dir` parameter.
pub fn validate_calc_dir_name(name: &str) -> PipelineResult<()> {
    if name_pattern().is_match(name) && name.len() <= 128 {
        Ok(())
    } else {
        Err(PipelineError::InvalidParameter {
            stage: name.to_string(),
            param: "calc_dir".to_string(),
            reason: format!(
                "'{name}' must be 1-128 characters of letters, digits, '.', '_' or '-' and not start with a symbol"
            ),
        })
    }
}
