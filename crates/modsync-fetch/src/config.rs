use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::{BandwidthLimit, SpeedUnit};
use crate::error::Result;

pub const MIN_PARALLEL_DOWNLOADS: usize = 1;
pub const MAX_PARALLEL_DOWNLOADS: usize = 50;

/// Tuning knobs for the transfer engine.
///
/// Every field has a default, so a partial TOML table is enough:
///
/// ```
/// use modsync_fetch::TransferConfig;
///
/// let config = TransferConfig::from_toml_str(
///     "parallel_downloads = 4\nbandwidth_limit = 512\nbandwidth_unit = \"kib\"",
/// )
/// .unwrap();
/// assert_eq!(config.parallel_downloads(), 4);
/// assert_eq!(config.bandwidth().as_bytes_per_second(), 512 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Queue admission width. Clamped to 1..=50.
    pub parallel_downloads: usize,

    /// Concurrent block transfers across all queued groups.
    pub download_slots: usize,

    /// Direct-path fan-out. Derived from `parallel_downloads` when unset.
    pub direct_parallelism: Option<usize>,

    /// Record decode fan-out. Derived from the CPU count when unset.
    pub decode_parallelism: Option<usize>,

    pub claim_expiry_secs: u64,

    /// Readiness keepalive cadence for the queued path.
    pub ready_poll_interval_ms: u64,

    pub circuit_threshold: u32,

    /// Total bandwidth ceiling; 0 disables throttling.
    pub bandwidth_limit: u64,

    pub bandwidth_unit: SpeedUnit,

    /// Timeout for the small RPCs. Block and direct bodies are not bounded.
    pub request_timeout_secs: u64,

    pub temp_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_downloads: 10,
            download_slots: 2,
            direct_parallelism: None,
            decode_parallelism: None,
            claim_expiry_secs: 300,
            ready_poll_interval_ms: 5000,
            circuit_threshold: 3,
            bandwidth_limit: 0,
            bandwidth_unit: SpeedUnit::Bytes,
            request_timeout_secs: 30,
            temp_dir: None,
        }
    }
}

impl TransferConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> { Ok(toml::from_str(s)?) }

    #[must_use]
    pub fn with_parallel_downloads(mut self, n: usize) -> Self {
        self.parallel_downloads = n;
        self
    }

    #[must_use]
    pub fn with_download_slots(mut self, n: usize) -> Self {
        self.download_slots = n;
        self
    }

    #[must_use]
    pub fn with_direct_parallelism(mut self, n: usize) -> Self {
        self.direct_parallelism = Some(n);
        self
    }

    #[must_use]
    pub fn with_decode_parallelism(mut self, n: usize) -> Self {
        self.decode_parallelism = Some(n);
        self
    }

    #[must_use]
    pub fn with_claim_expiry(mut self, expiry: Duration) -> Self {
        self.claim_expiry_secs = expiry.as_secs();
        self
    }

    #[must_use]
    pub fn with_ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    #[must_use]
    pub fn with_circuit_threshold(mut self, threshold: u32) -> Self {
        self.circuit_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_bandwidth(mut self, limit: BandwidthLimit) -> Self {
        self.bandwidth_limit = limit.value;
        self.bandwidth_unit = limit.unit;
        self
    }

    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn parallel_downloads(&self) -> usize {
        clamp_parallel(self.parallel_downloads)
    }

    pub fn download_slots(&self) -> usize { self.download_slots.max(1) }

    pub fn direct_parallelism(&self) -> usize {
        self.direct_parallelism
            .unwrap_or_else(|| self.parallel_downloads().clamp(1, 10))
            .max(1)
    }

    pub fn decode_parallelism(&self) -> usize {
        self.decode_parallelism
            .unwrap_or_else(|| {
                let cpus = std::thread::available_parallelism().map_or(4, |n| n.get());
                (cpus / 2).clamp(2, 8)
            })
            .max(1)
    }

    pub fn claim_expiry(&self) -> Duration { Duration::from_secs(self.claim_expiry_secs.max(1)) }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }

    pub fn circuit_threshold(&self) -> u32 { self.circuit_threshold.max(1) }

    pub fn bandwidth(&self) -> BandwidthLimit {
        BandwidthLimit::new(self.bandwidth_limit, self.bandwidth_unit)
    }

    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs.max(1)) }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("modsync"))
    }
}

pub(crate) fn clamp_parallel(n: usize) -> usize {
    n.clamp(MIN_PARALLEL_DOWNLOADS, MAX_PARALLEL_DOWNLOADS)
}
