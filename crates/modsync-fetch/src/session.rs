//! The download façade: routing, claims, sweeps and progress.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cancel::cancellable;
use crate::config::TransferConfig;
use crate::data::{
    BandwidthLimit, ContentHash, FileSizeEntry, ForbiddenFile, GroupKey, GroupPhase, GroupProgress,
    RequestedFile, TransferReport, TransferRequest,
};
use crate::dedup::{Deduplicator, DownloadClaim, Responsibility};
use crate::direct::{CircuitState, DirectOutcome, DirectPath};
use crate::error::{Error, Result};
use crate::net::{HostApi, HttpClient};
use crate::orchestrator::TransferOrchestrator;
use crate::queued::{QueuedItem, QueuedPath};
use crate::store::ByteStore;

/// Live progress of every group currently being processed.
///
/// Concurrent calls that open the same key share one entry: totals add up
/// and the entry stays until the last handle closes.
#[derive(Clone, Default)]
pub struct ProgressBoard {
    groups: Arc<Mutex<HashMap<GroupKey, BoardEntry>>>,
}

struct BoardEntry {
    progress: GroupProgress,
    handles: usize,
}

impl ProgressBoard {
    pub fn new() -> Self { Self::default() }

    /// Register a group and return the handle its worker writes through.
    pub fn open(&self, key: GroupKey, total_files: u64, total_bytes: u64) -> GroupHandle {
        let mut groups = self.groups.lock();
        match groups.get_mut(&key) {
            Some(entry) => {
                entry.handles += 1;
                entry.progress.total_files += total_files;
                entry.progress.total_bytes += total_bytes;
            }
            None => {
                let progress = GroupProgress::new(total_files, total_bytes);
                groups.insert(key.clone(), BoardEntry { progress, handles: 1 });
            }
        }
        drop(groups);
        GroupHandle {
            key,
            board: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get(&self, key: &GroupKey) -> Option<GroupProgress> {
        self.groups.lock().get(key).map(|e| e.progress.clone())
    }

    pub fn snapshot(&self) -> HashMap<GroupKey, GroupProgress> {
        self.groups
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.progress.clone()))
            .collect()
    }
}

/// Write access to one group's progress entry.
#[derive(Clone)]
pub struct GroupHandle {
    key: GroupKey,
    board: ProgressBoard,
    closed: Arc<AtomicBool>,
}

impl GroupHandle {
    pub fn key(&self) -> &GroupKey { &self.key }

    fn update(&self, f: impl FnOnce(&mut GroupProgress)) {
        if let Some(entry) = self.board.groups.lock().get_mut(&self.key) {
            f(&mut entry.progress);
        }
    }

    pub fn set_phase(&self, phase: GroupPhase) {
        debug!(group = %self.key, %phase, "phase");
        self.update(|p| p.phase = phase);
    }

    pub fn add_bytes(&self, n: u64) {
        self.update(|p| p.transferred_bytes = p.transferred_bytes.saturating_add(n));
    }

    pub fn add_file(&self) { self.update(|p| p.transferred_files += 1); }

    /// Release this handle's share of the entry. The last close marks the
    /// group done and drops it from the board. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut groups = self.board.groups.lock();
        let Some(entry) = groups.get_mut(&self.key) else {
            return;
        };
        entry.handles -= 1;
        if entry.handles == 0 {
            entry.progress.phase = GroupPhase::Done;
            groups.remove(&self.key);
            debug!(group = %self.key, phase = %GroupPhase::Done, "phase");
        }
    }
}

/// Coordinates the direct and queued paths for download calls.
///
/// One session is shared by every caller in a process; concurrent
/// [`download`](Self::download) calls for overlapping hashes share fetches
/// through its [`Deduplicator`].
pub struct TransferSession<C, S> {
    config: TransferConfig,
    orchestrator: Arc<TransferOrchestrator<C>>,
    dedup: Deduplicator,
    store: Arc<S>,
    direct: DirectPath<C, S>,
    queued: QueuedPath<C, S>,
    progress: ProgressBoard,
}

impl<C: HttpClient, S: ByteStore> TransferSession<C, S> {
    /// `service` is the metadata service base URI; it also serves as the
    /// queue host for rows that do not name one.
    pub fn new(client: Arc<C>, service: Url, store: Arc<S>, config: TransferConfig) -> Self {
        let api = HostApi::new(client, service, config.request_timeout());
        let orchestrator = Arc::new(TransferOrchestrator::new(api, &config));
        let dedup = Deduplicator::new(config.claim_expiry());
        let direct = DirectPath::new(
            Arc::clone(&orchestrator),
            Arc::clone(&store),
            config.circuit_threshold(),
        );
        let queued =
            QueuedPath::new(Arc::clone(&orchestrator), Arc::clone(&store), dedup.clone(), &config);
        Self {
            config,
            orchestrator,
            dedup,
            store,
            direct,
            queued,
            progress: ProgressBoard::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TransferOrchestrator<C>> { &self.orchestrator }

    pub fn deduplicator(&self) -> &Deduplicator { &self.dedup }

    pub fn circuit_state(&self) -> CircuitState { self.direct.breaker().state() }

    pub fn progress(&self) -> HashMap<GroupKey, GroupProgress> { self.progress.snapshot() }

    pub fn set_bandwidth(&self, limit: BandwidthLimit) { self.orchestrator.set_bandwidth(limit); }

    pub fn set_parallel_downloads(&self, n: usize) { self.orchestrator.set_parallelism(n); }

    /// The service connection dropped: fail everything in flight so no
    /// waiter hangs, and give the direct path a fresh start.
    pub fn on_disconnect(&self) {
        let failed = self.dedup.complete_all(false);
        self.direct.breaker().reset();
        info!(failed, "disconnected, in-flight transfers failed");
    }

    pub fn on_reconnect(&self) { self.direct.breaker().reset(); }

    /// Forward a push notification that a queued request is ready.
    pub fn mark_ready(&self, request_id: uuid::Uuid) -> bool { self.orchestrator.mark_ready(request_id) }

    /// Make `files` present in the store.
    ///
    /// Per-file problems land in the report. `Err` is returned when the size
    /// lookup fails or `cancel` fires; claims this call owned are resolved as
    /// failed either way.
    pub async fn download(
        &self,
        unit: &str,
        files: Vec<RequestedFile>,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        let mut seen = HashSet::new();
        let files: Vec<RequestedFile> = files.into_iter().filter(|f| seen.insert(f.hash.clone())).collect();
        if files.is_empty() {
            return Ok(report);
        }

        let hashes: Vec<ContentHash> = files.iter().map(|f| f.hash.clone()).collect();
        let rows = cancellable(cancel, self.orchestrator.fetch_file_sizes(&hashes)).await??;
        let requests = self.route(files, rows, &mut report);

        let mut waiting: Vec<DownloadClaim> = Vec::new();
        let mut owned: Vec<(TransferRequest, DownloadClaim)> = Vec::new();
        for request in requests {
            let claim = self.dedup.claim(&request.hash);
            if !claim.is_owner() {
                debug!(hash = %request.hash, "already in flight, waiting");
                waiting.push(claim);
                continue;
            }
            if self.reuse_stored(&request, &claim) {
                report.succeeded.push(request.hash.clone());
                continue;
            }
            owned.push((request, claim));
        }
        let owned_claims: Vec<DownloadClaim> = owned.iter().map(|(_, c)| c.clone()).collect();

        let outcome = self.transfer(unit, owned, cancel).await;

        // Nothing this call owns may stay in flight past this point.
        for claim in &owned_claims {
            self.dedup.abandon(claim);
        }
        outcome?;

        for claim in owned_claims.iter().chain(waiting.iter()) {
            if cancellable(cancel, claim.outcome().wait()).await? {
                report.succeeded.push(claim.hash().clone());
            } else {
                report.failed.push(claim.hash().clone());
            }
        }

        report.sort();
        info!(
            unit,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            forbidden = report.forbidden.len(),
            missing = report.missing.len(),
            "download finished"
        );
        Ok(report)
    }

    /// Turn size rows into routing decisions; forbidden and missing files
    /// go straight to the report.
    fn route(
        &self,
        files: Vec<RequestedFile>,
        rows: Vec<FileSizeEntry>,
        report: &mut TransferReport,
    ) -> Vec<TransferRequest> {
        let mut rows: HashMap<ContentHash, FileSizeEntry> = rows
            .into_iter()
            .filter_map(|row| match ContentHash::parse(&row.hash) {
                Ok(hash) => Some((hash, row)),
                Err(_) => {
                    warn!(hash = %row.hash, "size lookup returned an invalid hash");
                    None
                }
            })
            .collect();

        let service = self.orchestrator.api().service();
        let mut requests = Vec::with_capacity(files.len());
        for file in files {
            let Some(row) = rows.remove(&file.hash) else {
                report.missing.push(file.hash);
                continue;
            };
            if row.is_forbidden {
                report.forbidden.push(ForbiddenFile {
                    hash: file.hash,
                    forbidden_by: row.forbidden_by.unwrap_or_default(),
                });
                continue;
            }
            if !row.file_exists {
                report.missing.push(file.hash);
                continue;
            }

            let direct_uri = row.url.as_deref().filter(|u| !u.is_empty()).and_then(|u| match Url::parse(u) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(hash = %file.hash, url = u, error = %e, "ignoring unparsable direct url");
                    None
                }
            });
            let queue_host_uri = row
                .queue_host
                .as_deref()
                .and_then(|h| Url::parse(h).ok())
                .unwrap_or_else(|| service.clone());

            requests.push(TransferRequest {
                hash: file.hash,
                expected_size: row.size,
                game_path: file.game_path,
                direct_uri,
                queue_host_uri,
                is_forbidden: false,
            });
        }
        requests
    }

    /// Satisfy an owned claim from the store when the bytes are already
    /// there, migrating the extension if the game path needs another one.
    fn reuse_stored(&self, request: &TransferRequest, claim: &DownloadClaim) -> bool {
        let Some(entry) = self.store.get(&request.hash) else {
            return false;
        };
        let extension = request.extension();
        if entry.extension != extension {
            if let Err(e) = self.store.migrate_extension(&entry, &extension) {
                warn!(hash = %request.hash, error = %e, "extension migration failed, downloading again");
                self.store.remove_by_hash(&request.hash);
                return false;
            }
        }
        self.dedup.complete(claim, Responsibility::Unresolved, true)
    }

    async fn transfer(
        &self,
        unit: &str,
        owned: Vec<(TransferRequest, DownloadClaim)>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (direct, mut queue): (Vec<_>, Vec<_>) =
            owned.into_iter().partition(|(r, _)| r.direct_uri.is_some());

        for (_, claim) in &queue {
            self.dedup.assign(claim, Responsibility::QueueOwned);
        }
        queue.extend(self.run_direct(unit, direct, cancel).await?);
        if queue.is_empty() {
            return Ok(());
        }

        let mut by_host: HashMap<Url, Vec<QueuedItem>> = HashMap::new();
        for (request, claim) in queue {
            by_host
                .entry(request.queue_host_uri.clone())
                .or_default()
                .push(QueuedItem { request, claim });
        }

        let groups = by_host.into_iter().map(|(host, items)| self.run_queued(unit, host, items, cancel));
        let results = join_all(groups).await;
        if cancel.is_cancelled() || results.iter().any(|r| matches!(r, Err(Error::Cancelled))) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Run direct fetches with bounded fan-out. Returns the requests handed
    /// off to the queued path.
    async fn run_direct(
        &self,
        unit: &str,
        direct: Vec<(TransferRequest, DownloadClaim)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(TransferRequest, DownloadClaim)>> {
        if direct.is_empty() {
            return Ok(Vec::new());
        }

        let total_bytes = direct.iter().map(|(r, _)| r.expected_size.max(0) as u64).sum();
        let group = self.progress.open(GroupKey::direct(unit), direct.len() as u64, total_bytes);
        group.set_phase(GroupPhase::Downloading);

        for (_, claim) in &direct {
            self.dedup.assign(claim, Responsibility::DirectOwned);
        }

        let results: Vec<_> = stream::iter(direct)
            .map(|(request, claim)| {
                let group = &group;
                async move {
                    let outcome = self.direct.try_fetch(&request, Some(group), cancel).await;
                    (request, claim, outcome)
                }
            })
            .buffer_unordered(self.config.direct_parallelism())
            .collect()
            .await;

        let mut fallback = Vec::new();
        let mut cancelled = false;
        for (request, claim, outcome) in results {
            match outcome {
                Ok(DirectOutcome::Succeeded) => {
                    group.add_file();
                    self.dedup.complete(&claim, Responsibility::DirectOwned, true);
                }
                Ok(DirectOutcome::Unavailable | DirectOutcome::Failed) => {
                    // The queued path resolves this claim from here on.
                    self.dedup.hand_off(&claim);
                    fallback.push((request, claim));
                }
                Err(_) => cancelled = true,
            }
        }
        group.close();
        if cancelled || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !fallback.is_empty() {
            debug!(unit, count = fallback.len(), "falling back to queued delivery");
        }
        Ok(fallback)
    }

    async fn run_queued(
        &self,
        unit: &str,
        host: Url,
        items: Vec<QueuedItem>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total_bytes = items.iter().map(|i| i.request.expected_size.max(0) as u64).sum();
        let key = GroupKey::host(unit, host.as_str());
        let group = self.progress.open(key, items.len() as u64, total_bytes);
        let claims: Vec<DownloadClaim> = items.iter().map(|i| i.claim.clone()).collect();

        let result = self.queued.run(&host, items, &group, cancel).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                warn!(unit, %host, error = %e, "queued group failed");
            }
        }

        // Anything the group did not resolve fails now.
        let swept = claims
            .iter()
            .filter(|c| self.dedup.complete(c, Responsibility::QueueOwned, false))
            .count();
        if swept > 0 {
            debug!(unit, %host, swept, "resolved leftover queued claims as failed");
        }
        group.close();
        result
    }
}
