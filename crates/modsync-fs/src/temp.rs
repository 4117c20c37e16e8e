use std::path::{Path, PathBuf};

use tracing::warn;

use crate::place::{place_file, remove_if_exists};
use crate::Result;

/// A file path that is removed when the guard goes out of scope.
///
/// Partial downloads and block files are created behind a `TempPath` so
/// that every early return, error or cancelled task leaves nothing behind.
/// Call [`TempPath::persist`] to move the file into place instead.
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
    armed: bool,
}

impl TempPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the file to `dest`. On failure the temp file is still removed
    /// when the returned error has been handled and the guard dropped.
    pub fn persist(mut self, dest: impl AsRef<Path>) -> Result<()> {
        place_file(&self.path, dest)?;
        self.armed = false;
        Ok(())
    }

    /// Remove the file now and report the outcome, rather than silently on drop.
    pub fn cleanup(mut self) -> Result<bool> {
        self.armed = false;
        remove_if_exists(&self.path)
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = remove_if_exists(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
        }
    }
}
