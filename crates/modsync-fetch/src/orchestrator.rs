//! Shared admission control, bandwidth and queue handshake state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{TransferConfig, clamp_parallel};
use crate::data::{BandwidthLimit, ContentHash, FileSizeEntry};
use crate::error::{Error, Result};
use crate::net::{HostApi, HttpClient};
use crate::rate::{BandwidthBroadcast, ThrottledStream};

type ReadyTable = Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>;

/// Owns the limits every transfer path shares.
///
/// - queue admission: how many queued groups may be in progress at once,
///   resizable at runtime
/// - download slots: concurrent block transfers
/// - the bandwidth ceiling and its broadcast to active streams
/// - readiness bookkeeping for queued requests
pub struct TransferOrchestrator<C> {
    api: HostApi<C>,
    admission: RwLock<Arc<Semaphore>>,
    parallelism: AtomicUsize,
    slots: Arc<Semaphore>,
    slot_capacity: usize,
    bandwidth: BandwidthBroadcast,
    ready: ReadyTable,
}

impl<C: HttpClient> TransferOrchestrator<C> {
    pub fn new(api: HostApi<C>, config: &TransferConfig) -> Self {
        let parallelism = config.parallel_downloads();
        let slot_capacity = config.download_slots();
        Self {
            api,
            admission: RwLock::new(Arc::new(Semaphore::new(parallelism))),
            parallelism: AtomicUsize::new(parallelism),
            slots: Arc::new(Semaphore::new(slot_capacity)),
            slot_capacity,
            bandwidth: BandwidthBroadcast::new(config.bandwidth()),
            ready: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn api(&self) -> &HostApi<C> { &self.api }

    /// Size, existence and routing metadata for `hashes`.
    pub async fn fetch_file_sizes(&self, hashes: &[ContentHash]) -> Result<Vec<FileSizeEntry>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.api.file_sizes(hashes).await?;
        debug!(requested = hashes.len(), returned = rows.len(), "size lookup done");
        Ok(rows)
    }

    /// Wait for a queue admission permit.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        loop {
            let semaphore = Arc::clone(&self.admission.read());
            match semaphore.acquire_owned().await {
                Ok(permit) => return Ok(permit),
                // Closed by a resize; retry on the replacement.
                Err(_) => continue,
            }
        }
    }

    /// Resize queue admission. Existing permits stay valid; waiters move to
    /// the new semaphore.
    pub fn set_parallelism(&self, n: usize) {
        let n = clamp_parallel(n);
        if self.parallelism.swap(n, Ordering::SeqCst) == n {
            return;
        }
        let old = std::mem::replace(&mut *self.admission.write(), Arc::new(Semaphore::new(n)));
        old.close();
        info!(parallelism = n, "queue admission resized");
    }

    pub fn parallelism(&self) -> usize { self.parallelism.load(Ordering::SeqCst) }

    /// Wait for a block transfer slot.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)
    }

    pub fn slot_capacity(&self) -> usize { self.slot_capacity }

    pub fn available_slots(&self) -> usize { self.slots.available_permits() }

    pub fn bandwidth(&self) -> BandwidthLimit { self.bandwidth.limit() }

    pub fn set_bandwidth(&self, limit: BandwidthLimit) { self.bandwidth.set_limit(limit); }

    /// Wrap a body stream in the shared bandwidth limit.
    pub fn throttle<S>(&self, stream: S) -> ThrottledStream<S> { self.bandwidth.throttle(stream) }

    /// Active throttled transfers.
    pub fn active_transfers(&self) -> usize { self.bandwidth.active() }

    /// Start tracking readiness of `request_id`. The entry is removed when
    /// the returned guard drops.
    pub fn begin_wait(&self, request_id: Uuid) -> ReadyWait {
        let (tx, rx) = watch::channel(false);
        self.ready.lock().insert(request_id, tx);
        ReadyWait {
            request_id,
            rx,
            table: Arc::clone(&self.ready),
        }
    }

    /// External "your block is ready" signal. Returns whether anyone was
    /// waiting for `request_id`.
    pub fn mark_ready(&self, request_id: Uuid) -> bool {
        match self.ready.lock().get(&request_id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn pending_ready_count(&self) -> usize { self.ready.lock().len() }
}

/// Readiness registration for one queued request.
pub struct ReadyWait {
    request_id: Uuid,
    rx: watch::Receiver<bool>,
    table: ReadyTable,
}

impl ReadyWait {
    pub fn request_id(&self) -> Uuid { self.request_id }

    pub fn is_ready(&self) -> bool { *self.rx.borrow() }

    /// Resolves once `mark_ready` fires for this request.
    pub async fn ready(&mut self) {
        if self.rx.wait_for(|ready| *ready).await.is_err() {
            // Sender gone means the entry was dropped; never resolves.
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for ReadyWait {
    fn drop(&mut self) { self.table.lock().remove(&self.request_id); }
}
