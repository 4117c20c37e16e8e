use serde::{Deserialize, Serialize};
use url::Url;

use super::hash::ContentHash;

/// One file a caller wants present locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedFile {
    pub hash: ContentHash,
    pub game_path: String,
}

impl RequestedFile {
    pub fn new(hash: ContentHash, game_path: impl Into<String>) -> Self {
        Self {
            hash,
            game_path: game_path.into(),
        }
    }
}

/// A row of the size/metadata lookup response.
///
/// Field aliases accept the PascalCase spelling some older servers emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSizeEntry {
    #[serde(alias = "Hash")]
    pub hash: String,

    #[serde(default, alias = "Size")]
    pub size: i64,

    #[serde(default, alias = "FileExists")]
    pub file_exists: bool,

    #[serde(default, alias = "Url")]
    pub url: Option<String>,

    #[serde(default, alias = "QueueHost")]
    pub queue_host: Option<String>,

    #[serde(default, alias = "IsForbidden")]
    pub is_forbidden: bool,

    #[serde(default, alias = "ForbiddenBy")]
    pub forbidden_by: Option<String>,
}

/// An immutable routing decision for one hash, built from the size lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub hash: ContentHash,
    pub expected_size: i64,
    pub game_path: String,
    /// CDN location for the direct path, when the server offers one.
    pub direct_uri: Option<Url>,
    /// Host that serves this hash through the enqueue/stream protocol.
    pub queue_host_uri: Url,
    pub is_forbidden: bool,
}

impl TransferRequest {
    /// File extension the stored copy should carry, taken from the game path.
    pub fn extension(&self) -> String { extension_of(&self.game_path) }
}

pub(crate) fn extension_of(game_path: &str) -> String {
    let name = game_path.rsplit(['/', '\\']).next().unwrap_or(game_path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => "dat".to_string(),
    }
}
