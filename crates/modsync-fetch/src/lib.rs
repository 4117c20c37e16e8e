//! Deduplicated, verified transfer of content-addressed assets.
//!
//! # Architecture
//!
//! - [`data`] - Immutable request, progress and report types
//! - [`codec`] - Block container and compressed frame formats
//! - [`rate`] - Bandwidth limiting shared across transfers
//! - [`net`] - HTTP seam and the remote calls built on it
//! - [`Deduplicator`] - At most one fetch per hash, many observers
//! - [`DirectPath`] / [`QueuedPath`] - The two delivery paths
//! - [`TransferSession`] - Routes a download call across both paths
//!
//! # Key Features
//!
//! - **Single fetch per hash**: concurrent callers share one outcome
//! - **Verified output**: every file is hashed while it is decompressed and
//!   only placed into the store when the digest matches
//! - **Graceful degradation**: repeated direct failures open a circuit and
//!   route everything through the queued hosts until reset
//! - **Clean cancellation**: slots are released, claims resolved, partial
//!   files removed

pub mod codec;
pub mod data;
pub mod net;
pub mod rate;

mod cancel;
mod config;
mod dedup;
mod direct;
mod error;
mod orchestrator;
mod queued;
mod session;
mod store;

pub use cancel::cancellable;
pub use config::{MAX_PARALLEL_DOWNLOADS, MIN_PARALLEL_DOWNLOADS, TransferConfig};
pub use data::{
    BandwidthLimit, ContentHash, FileSizeEntry, ForbiddenFile, GroupKey, GroupPhase, GroupProgress,
    GroupTarget, RequestedFile, SpeedUnit, TransferReport, TransferRequest,
};
pub use dedup::{ClaimOutcome, Deduplicator, DownloadClaim, Responsibility};
pub use direct::{CircuitBreaker, CircuitState, DirectOutcome, DirectPath};
pub use error::{Error, Result};
pub use net::{BoxStream, HostApi, HttpClient, HttpResponse};
pub use orchestrator::{ReadyWait, TransferOrchestrator};
pub use queued::{QueuedItem, QueuedPath};
pub use session::{GroupHandle, ProgressBoard, TransferSession};
pub use store::{ByteStore, FlatDirStore, StoreEntry};

#[cfg(feature = "reqwest")]
pub use net::ReqwestClient;

pub use tokio_util::sync::CancellationToken;
