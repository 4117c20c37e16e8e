//! Content-addressed persistence the engine writes into.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use modsync_fs::{place_file, remove_if_exists};
use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::data::ContentHash;
use crate::error::Result;

/// A stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub hash: ContentHash,
    pub path: PathBuf,
    pub extension: String,
}

/// Maps hashes to local files.
///
/// Implementations must tolerate concurrent calls for different hashes.
/// Calls for the same hash are serialized by the caller.
pub trait ByteStore: Send + Sync + 'static {
    fn get(&self, hash: &ContentHash) -> Option<StoreEntry>;

    /// Where a file for `hash` with `extension` should be placed.
    fn path_for(&self, hash: &ContentHash, extension: &str) -> PathBuf;

    /// Register the file already placed at `path`. Returns `None` when
    /// nothing is there.
    fn create(&self, path: &Path, hash: &ContentHash) -> Option<StoreEntry>;

    fn remove_by_hash(&self, hash: &ContentHash);

    /// Move an existing entry so it carries `extension`.
    fn migrate_extension(&self, entry: &StoreEntry, extension: &str) -> Result<StoreEntry>;
}

/// A single directory of `<HASH>.<ext>` files.
pub struct FlatDirStore {
    root: PathBuf,
    index: RwLock<HashMap<ContentHash, StoreEntry>>,
}

impl FlatDirStore {
    /// Open `root`, creating it if needed, and index the files already in it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut index = HashMap::new();
        for dirent in fs::read_dir(&root)? {
            let path = dirent?.path();
            if !path.is_file() {
                continue;
            }
            let Some(entry) = entry_for(&path) else {
                continue;
            };
            index.insert(entry.hash.clone(), entry);
        }

        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn len(&self) -> usize { self.index.read().len() }

    pub fn is_empty(&self) -> bool { self.index.read().is_empty() }
}

/// A hidden, unique sibling of `dest` for writing partial output, so the
/// final rename stays on one filesystem.
pub(crate) fn partial_path_for(dest: &Path) -> PathBuf {
    let name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("download");
    dest.with_file_name(format!(".{name}.{}.part", Uuid::new_v4().simple()))
}

fn entry_for(path: &Path) -> Option<StoreEntry> {
    let stem = path.file_stem()?.to_str()?;
    let hash = ContentHash::parse(stem).ok()?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    Some(StoreEntry {
        hash,
        path: path.to_path_buf(),
        extension,
    })
}

impl ByteStore for FlatDirStore {
    fn get(&self, hash: &ContentHash) -> Option<StoreEntry> {
        let entry = self.index.read().get(hash).cloned()?;
        if entry.path.is_file() {
            Some(entry)
        } else {
            self.index.write().remove(hash);
            None
        }
    }

    fn path_for(&self, hash: &ContentHash, extension: &str) -> PathBuf {
        self.root.join(format!("{hash}.{}", extension.to_ascii_lowercase()))
    }

    fn create(&self, path: &Path, hash: &ContentHash) -> Option<StoreEntry> {
        if !path.is_file() {
            return None;
        }
        let entry = StoreEntry {
            hash: hash.clone(),
            path: path.to_path_buf(),
            extension: path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase(),
        };
        self.index.write().insert(hash.clone(), entry.clone());
        Some(entry)
    }

    fn remove_by_hash(&self, hash: &ContentHash) {
        let Some(entry) = self.index.write().remove(hash) else {
            return;
        };
        if let Err(e) = remove_if_exists(&entry.path) {
            warn!(%hash, path = %entry.path.display(), error = %e, "failed to remove stored file");
        }
    }

    fn migrate_extension(&self, entry: &StoreEntry, extension: &str) -> Result<StoreEntry> {
        let extension = extension.to_ascii_lowercase();
        if entry.extension == extension {
            return Ok(entry.clone());
        }
        let dest = self.path_for(&entry.hash, &extension);
        place_file(&entry.path, &dest)?;

        let migrated = StoreEntry {
            hash: entry.hash.clone(),
            path: dest,
            extension,
        };
        self.index.write().insert(entry.hash.clone(), migrated.clone());
        Ok(migrated)
    }
}
