//! Lifecycle events for calculation directories and chains.
//!
//! Every state transition the store, runner and orchestrator make is also
//! published to an [`EventSink`]. The default sink logs through `tracing`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the pipeline core.
pub mod names {
    /// A stage acquired its calculation directory.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage committed a complete directory.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage left its directory failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// Prior artifacts were deleted for a rerun.
    pub const CALC_OVERWRITTEN: &str = "calc.overwritten";
    /// A stale directory was discarded.
    pub const CALC_DISCARDED: &str = "calc.discarded";
    /// A stale directory was resumed.
    pub const CALC_RESUMED: &str = "calc.resumed";
    /// A chain started executing.
    pub const CHAIN_STARTED: &str = "chain.started";
    /// A chain finished with every stage complete.
    pub const CHAIN_COMPLETED: &str = "chain.completed";
    /// A chain stopped at a failing stage.
    pub const CHAIN_FAILED: &str = "chain.failed";
    /// A report bundle was written.
    pub const REPORT_BUILT: &str = "report.built";
}
