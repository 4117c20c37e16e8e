//! Batched delivery: enqueue with a host, wait for readiness, stream one
//! block container and decode its records into the store.

use std::collections::HashMap;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use modsync_fs::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::cancel::cancellable;
use crate::codec::{CodecError, ContainerReader, decode_frame_verified};
use crate::config::TransferConfig;
use crate::data::{ContentHash, GroupPhase, TransferRequest};
use crate::dedup::{Deduplicator, DownloadClaim, Responsibility};
use crate::error::{Error, Result};
use crate::net::HttpClient;
use crate::orchestrator::TransferOrchestrator;
use crate::session::GroupHandle;
use crate::store::{ByteStore, partial_path_for};

/// One hash routed to a queued host, with the claim the queued path must
/// resolve.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub request: TransferRequest,
    pub claim: DownloadClaim,
}

pub struct QueuedPath<C, S> {
    orchestrator: Arc<TransferOrchestrator<C>>,
    store: Arc<S>,
    dedup: Deduplicator,
    temp_dir: PathBuf,
    decode_parallelism: usize,
    poll_interval: Duration,
}

impl<C: HttpClient, S: ByteStore> QueuedPath<C, S> {
    pub fn new(
        orchestrator: Arc<TransferOrchestrator<C>>,
        store: Arc<S>,
        dedup: Deduplicator,
        config: &TransferConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            dedup,
            temp_dir: config.temp_dir(),
            decode_parallelism: config.decode_parallelism(),
            poll_interval: config.ready_poll_interval(),
        }
    }

    /// Fetch `items` from `host` as one block.
    ///
    /// Claims are resolved as their records are decoded. Items whose record
    /// never arrives are left for the caller's sweep.
    pub async fn run(
        &self,
        host: &Url,
        items: Vec<QueuedItem>,
        progress: &GroupHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let hashes: Vec<ContentHash> = items.iter().map(|i| i.request.hash.clone()).collect();

        progress.set_phase(GroupPhase::WaitingForSlot);
        let _admission = cancellable(cancel, self.orchestrator.admit()).await??;

        progress.set_phase(GroupPhase::WaitingForQueue);
        let api = self.orchestrator.api();
        let request_id = cancellable(cancel, api.enqueue(host, &hashes)).await??;
        debug!(%host, %request_id, files = hashes.len(), "enqueued");

        let result = self.fetch_enqueued(host, request_id, &hashes, items, progress, cancel).await;
        if result.is_err() {
            // Let the host drop the job; the token may already be cancelled.
            api.cancel(host, request_id).await;
        }
        result
    }

    async fn fetch_enqueued(
        &self,
        host: &Url,
        request_id: Uuid,
        hashes: &[ContentHash],
        items: Vec<QueuedItem>,
        progress: &GroupHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.wait_ready(host, request_id, hashes, cancel).await?;

        progress.set_phase(GroupPhase::WaitingForSlot);
        let slot = cancellable(cancel, self.orchestrator.acquire_slot()).await??;

        progress.set_phase(GroupPhase::Downloading);
        let block = self.download_block(host, request_id, progress, cancel).await?;

        progress.set_phase(GroupPhase::Decompressing);
        let result = self.decode_block(&block, items, progress, cancel).await;
        if let Err(e) = block.cleanup() {
            warn!(%request_id, error = %e, "failed to remove block file");
        }
        drop(slot);
        result
    }

    /// Poll-and-keepalive until the host reports ready or a push arrives.
    async fn wait_ready(
        &self,
        host: &Url,
        request_id: Uuid,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let api = self.orchestrator.api();
        let mut wait = self.orchestrator.begin_wait(request_id);
        let mut deadline = Instant::now() + self.poll_interval;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = wait.ready() => {
                    debug!(%request_id, "ready by notification");
                    return Ok(());
                }
                _ = sleep_until(deadline) => {
                    if cancellable(cancel, api.check(host, request_id, hashes)).await?? {
                        debug!(%request_id, "ready by check");
                        return Ok(());
                    }
                    deadline = Instant::now() + self.poll_interval;
                }
            }
        }
    }

    async fn download_block(
        &self,
        host: &Url,
        request_id: Uuid,
        progress: &GroupHandle,
        cancel: &CancellationToken,
    ) -> Result<TempPath> {
        let api = self.orchestrator.api();
        let response = cancellable(cancel, api.block(host, request_id)).await??;

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let block = TempPath::new(self.temp_dir.join(format!("{request_id}.blk")));
        let mut file = tokio::fs::File::create(block.path()).await?;
        let mut body = self.orchestrator.throttle(response.body);

        let mut received = 0u64;
        while let Some(chunk) = cancellable(cancel, body.next()).await? {
            let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress.add_bytes(chunk.len() as u64);
        }
        file.flush().await?;
        debug!(%request_id, bytes = received, "block downloaded");
        Ok(block)
    }

    async fn decode_block(
        &self,
        block: &TempPath,
        items: Vec<QueuedItem>,
        progress: &GroupHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pending: HashMap<ContentHash, QueuedItem> =
            items.into_iter().map(|i| (i.request.hash.clone(), i)).collect();

        let file = tokio::fs::File::open(block.path()).await?;
        let mut reader = ContainerReader::new(file);
        let limit = Arc::new(Semaphore::new(self.decode_parallelism));
        let mut tasks = JoinSet::new();

        let mut outcome = Ok(());
        loop {
            let record = match cancellable(cancel, reader.next_record()).await {
                Ok(Ok(Some(record))) => record,
                Ok(Ok(None)) => break,
                Ok(Err(CodecError::Truncated { hash, expected, actual })) => {
                    warn!(%hash, expected, actual, "record truncated");
                    if let Some(item) = ContentHash::parse(&hash).ok().and_then(|h| pending.remove(&h)) {
                        self.dedup.complete(&item.claim, Responsibility::QueueOwned, false);
                    }
                    break;
                }
                Ok(Err(e)) => {
                    outcome = Err(e.into());
                    break;
                }
                Err(cancelled) => {
                    outcome = Err(cancelled);
                    break;
                }
            };

            let Some(item) = ContentHash::parse(&record.hash).ok().and_then(|h| pending.remove(&h)) else {
                warn!(hash = %record.hash, "skipping record that was not requested");
                continue;
            };

            let permit = match cancellable(cancel, Arc::clone(&limit).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => {
                    self.dedup.complete(&item.claim, Responsibility::QueueOwned, false);
                    outcome = Err(Error::Cancelled);
                    break;
                }
            };

            let store = Arc::clone(&self.store);
            let dedup = self.dedup.clone();
            let progress = progress.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let stored = store_record(store.as_ref(), &item.request, record.payload);
                if let Err(e) = &stored {
                    warn!(hash = %item.request.hash, error = %e, "record rejected");
                }
                if dedup.complete(&item.claim, Responsibility::QueueOwned, stored.is_ok()) && stored.is_ok() {
                    progress.add_file();
                }
            });
        }

        // Decode work always runs to completion so no partial output is
        // left behind.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "decode task failed");
            }
        }

        if !pending.is_empty() {
            debug!(missing = pending.len(), "records absent from block");
        }
        outcome
    }
}

/// Decompress and verify one record into the store. Blocking.
fn store_record<S: ByteStore>(store: &S, request: &TransferRequest, payload: Bytes) -> Result<()> {
    let dest = store.path_for(&request.hash, &request.extension());
    let temp = TempPath::new(partial_path_for(&dest));
    if let Some(parent) = temp.path().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(temp.path())?;
    let (writer, _) = decode_frame_verified(payload.as_ref(), BufWriter::new(file), &request.hash)?;
    writer.into_inner().map_err(|e| e.into_error())?;

    temp.persist(&dest)?;
    match store.create(&dest, &request.hash) {
        Some(_) => Ok(()),
        None => Err(Error::Fs(modsync_fs::Error::Vanished { path: dest })),
    }
}
