//! The calculation directory store.
//!
//! Every calculation directory lives under one store root and is described
//! by its `calc.json` manifest. The store is the single authority over the
//! absent → in-progress → complete | failed state machine: stages never
//! inspect the filesystem on their own.
//!
//! Layout of one directory:
//!
//! ```text
//! <root>/<name>/calc.json   manifest (written atomically)
//! <root>/<name>/input/      copied input overrides
//! <root>/<name>/output/     engine outputs
//! <root>/<name>/.lock       present while a run owns the directory
//! ```

mod calc_store;
mod directory;
mod handle;

pub use calc_store::{BeginRequest, CalcStore};
pub use directory::{CalcDirectory, CalcManifest, PredecessorRef};
pub use handle::CalcHandle;

/// Manifest file name inside a calculation directory.
pub const MANIFEST_FILE: &str = "calc.json";
/// Lock file name inside a calculation directory.
pub const LOCK_FILE: &str = ".lock";
/// Directory holding copied input overrides.
pub const INPUT_DIR: &str = "input";
/// Directory the engine writes into.
pub const OUTPUT_DIR: &str = "output";
