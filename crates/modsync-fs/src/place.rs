use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

use crate::{Error, Result};

fn crosses_devices(err: &io::Error) -> bool {
    err.raw_os_error() == Some(18) || err.kind() == io::ErrorKind::CrossesDevices
}

/// Move a finished file into its final location.
///
/// Some filesystems (network shares, sync folders) acknowledge a rename
/// without the destination ever appearing, so the destination is checked
/// afterwards and a missing file is reported as [`Error::Vanished`].
/// A rename across devices falls back to copy-then-remove.
pub fn place_file(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dest = dest.as_ref();

    if !src.exists() {
        return Err(Error::NotFound(src.to_path_buf()));
    }

    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::Write {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    match fs::rename(src, dest) {
        Ok(()) => {}
        Err(e) if crosses_devices(&e) => {
            fs::copy(src, dest).map_err(|e| Error::Write {
                path: dest.to_path_buf(),
                source: e,
            })?;
            if let Err(e) = remove_if_exists(src) {
                warn!(path = %src.display(), error = %e, "failed to remove source after copy");
            }
        }
        Err(e) => {
            return Err(Error::Write {
                path: dest.to_path_buf(),
                source: e,
            });
        }
    }

    if !dest.exists() {
        return Err(Error::Vanished {
            path: dest.to_path_buf(),
        });
    }

    Ok(())
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: impl AsRef<Path>) -> Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}
