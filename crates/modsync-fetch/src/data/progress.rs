use std::fmt;

/// What a transfer group is downloading from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupTarget {
    /// All direct-path fetches of one download call share this group.
    Direct,
    /// One queued host.
    Host(String),
}

/// Identifies one group's progress entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// The logical unit (e.g. a remote character) the download call is for.
    pub unit: String,
    pub target: GroupTarget,
}

impl GroupKey {
    pub fn direct(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            target: GroupTarget::Direct,
        }
    }

    pub fn host(unit: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            target: GroupTarget::Host(host.into()),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            GroupTarget::Direct => write!(f, "{}/direct", self.unit),
            GroupTarget::Host(host) => write!(f, "{}/{}", self.unit, host),
        }
    }
}

/// Externally observable state machine of a transfer group.
///
/// Groups move forward through these phases; the queued path visits every
/// phase, the direct group skips the queue-specific ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupPhase {
    #[default]
    Initializing,
    WaitingForSlot,
    WaitingForQueue,
    Downloading,
    Decompressing,
    Done,
}

impl fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupPhase::Initializing => write!(f, "Initializing"),
            GroupPhase::WaitingForSlot => write!(f, "WaitingForSlot"),
            GroupPhase::WaitingForQueue => write!(f, "WaitingForQueue"),
            GroupPhase::Downloading => write!(f, "Downloading"),
            GroupPhase::Decompressing => write!(f, "Decompressing"),
            GroupPhase::Done => write!(f, "Done"),
        }
    }
}

/// Counters for one group. Snapshots of this are handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupProgress {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub total_files: u64,
    pub transferred_files: u64,
    pub phase: GroupPhase,
}

impl GroupProgress {
    pub fn new(total_files: u64, total_bytes: u64) -> Self {
        Self {
            total_bytes,
            total_files,
            ..Self::default()
        }
    }

    pub fn percentage(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.transferred_bytes as f32 / self.total_bytes as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_display() {
        assert_eq!(GroupKey::direct("alice").to_string(), "alice/direct");
        assert_eq!(
            GroupKey::host("alice", "https://cdn.example").to_string(),
            "alice/https://cdn.example"
        );
    }

    #[test]
    fn test_percentage() {
        let mut progress = GroupProgress::new(2, 200);
        assert_eq!(progress.phase, GroupPhase::Initializing);
        progress.transferred_bytes = 50;
        assert_eq!(progress.percentage(), 25.0);
        assert_eq!(GroupProgress::default().percentage(), 0.0);
    }
}
