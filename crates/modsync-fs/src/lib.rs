//! Filesystem primitives for landing downloaded content.
//!
//! - [`place_file`] moves a finished temp file into its final location and
//!   confirms the destination exists afterwards.
//! - [`TempPath`] owns a partial output file and removes it unless persisted.

mod error;
mod place;
mod temp;

pub use error::{Error, Result};
pub use place::{place_file, remove_if_exists};
pub use temp::TempPath;
