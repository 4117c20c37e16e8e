//! Data layer: immutable types shared by the transfer paths.

pub mod bandwidth;
pub mod hash;
pub mod progress;
pub mod report;
pub mod request;

pub use bandwidth::{BandwidthLimit, SpeedUnit};
pub use hash::{ContentHash, MAX_HASH_LEN};
pub use progress::{GroupKey, GroupPhase, GroupProgress, GroupTarget};
pub use report::{ForbiddenFile, TransferReport};
pub use request::{FileSizeEntry, RequestedFile, TransferRequest};
