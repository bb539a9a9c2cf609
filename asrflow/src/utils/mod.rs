//! Utility functions for timestamps, naming and filesystem helpers.

pub mod fs;
mod naming;
mod timestamps;

pub use naming::validate_calc_dir_name;
pub use timestamps::{iso_timestamp, parse_timestamp, Timestamp};

/// Generates a random run identifier.
#[must_use]
pub fn generate_run_id() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}
