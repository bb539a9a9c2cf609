//! Stage descriptors and invocations.
//!
//! A [`StageDescriptor`] is the static contract of one stage kind: what it
//! needs from its predecessor, what it must produce, and which parameters it
//! accepts. A [`StageInvocation`] is one caller request to run a stage.

mod catalog;
mod descriptor;
mod invocation;

pub use catalog::{artifacts, StageCatalog};
pub use descriptor::{StageDescriptor, StageVariant};
pub use invocation::StageInvocation;
