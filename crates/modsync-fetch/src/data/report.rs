use super::hash::ContentHash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenFile {
    pub hash: ContentHash,
    pub forbidden_by: String,
}

/// Outcome of one download call.
///
/// Missing files are reported, not raised; the caller decides whether they
/// block whatever needed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub succeeded: Vec<ContentHash>,
    pub failed: Vec<ContentHash>,
    pub forbidden: Vec<ForbiddenFile>,
    /// Hashes the server does not have.
    pub missing: Vec<ContentHash>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.forbidden.is_empty() && self.missing.is_empty()
    }

    pub(crate) fn sort(&mut self) {
        self.succeeded.sort();
        self.failed.sort();
        self.missing.sort();
        self.forbidden.sort_by(|a, b| a.hash.cmp(&b.hash));
    }
}
