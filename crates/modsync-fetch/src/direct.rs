//! Single-file fetch straight from a CDN, guarded by a circuit breaker.

use std::io::{self, BufWriter};
use std::sync::Arc;

use futures_util::StreamExt;
use modsync_fs::TempPath;
use parking_lot::Mutex;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::cancellable;
use crate::codec::decode_frame_verified;
use crate::data::TransferRequest;
use crate::error::{Error, Result};
use crate::net::HttpClient;
use crate::orchestrator::TransferOrchestrator;
use crate::session::GroupHandle;
use crate::store::{ByteStore, partial_path_for};

/// Result of one direct attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectOutcome {
    /// No direct location, a 404, or the circuit is open. Not a failure.
    Unavailable,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub tripped: bool,
}

/// Counts consecutive direct failures and opens after `threshold` of them.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(CircuitState::default()),
        }
    }

    pub fn state(&self) -> CircuitState { *self.state.lock() }

    pub fn is_tripped(&self) -> bool { self.state.lock().tripped }

    /// Returns true when this failure tripped the circuit.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if !state.tripped && state.consecutive_failures >= self.threshold {
            state.tripped = true;
            return true;
        }
        false
    }

    pub fn record_success(&self) { *self.state.lock() = CircuitState::default(); }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.tripped || state.consecutive_failures > 0 {
            info!(failures = state.consecutive_failures, "direct circuit reset");
        }
        *state = CircuitState::default();
    }
}

/// Fetches single files from their direct URI into the store.
pub struct DirectPath<C, S> {
    orchestrator: Arc<TransferOrchestrator<C>>,
    store: Arc<S>,
    breaker: CircuitBreaker,
}

impl<C: HttpClient, S: ByteStore> DirectPath<C, S> {
    pub fn new(orchestrator: Arc<TransferOrchestrator<C>>, store: Arc<S>, circuit_threshold: u32) -> Self {
        Self {
            orchestrator,
            store,
            breaker: CircuitBreaker::new(circuit_threshold),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker { &self.breaker }

    /// Try to fetch `request` directly.
    ///
    /// Only cancellation is an `Err`; every other problem is reported as an
    /// outcome. The caller keeps responsibility for resolving the claim.
    pub async fn try_fetch(
        &self,
        request: &TransferRequest,
        progress: Option<&GroupHandle>,
        cancel: &CancellationToken,
    ) -> Result<DirectOutcome> {
        let Some(url) = &request.direct_uri else {
            return Ok(DirectOutcome::Unavailable);
        };
        if self.breaker.is_tripped() {
            debug!(hash = %request.hash, "direct circuit open, skipping");
            return Ok(DirectOutcome::Unavailable);
        }

        match self.fetch(request, url, progress, cancel).await {
            Ok(DirectOutcome::Failed) => {
                self.fail(request);
                Ok(DirectOutcome::Failed)
            }
            Ok(DirectOutcome::Succeeded) => {
                self.breaker.record_success();
                Ok(DirectOutcome::Succeeded)
            }
            Ok(DirectOutcome::Unavailable) => Ok(DirectOutcome::Unavailable),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                debug!(hash = %request.hash, error = %e, "direct fetch failed");
                self.fail(request);
                Ok(DirectOutcome::Failed)
            }
        }
    }

    fn fail(&self, request: &TransferRequest) {
        if self.breaker.record_failure() {
            warn!(
                hash = %request.hash,
                failures = self.breaker.state().consecutive_failures,
                "direct circuit tripped, falling back to queued delivery"
            );
        }
    }

    async fn fetch(
        &self,
        request: &TransferRequest,
        url: &url::Url,
        progress: Option<&GroupHandle>,
        cancel: &CancellationToken,
    ) -> Result<DirectOutcome> {
        let response = cancellable(cancel, self.orchestrator.api().direct(url)).await??;
        if response.status == 404 {
            debug!(hash = %request.hash, "not on direct host");
            return Ok(DirectOutcome::Unavailable);
        }
        if !response.is_success() {
            debug!(hash = %request.hash, status = response.status, "direct host error");
            return Ok(DirectOutcome::Failed);
        }

        let progress = progress.cloned();
        let body = self
            .orchestrator
            .throttle(response.body)
            .inspect(move |chunk| {
                if let (Some(progress), Ok(chunk)) = (&progress, chunk) {
                    progress.add_bytes(chunk.len() as u64);
                }
            })
            .take_until(cancel.clone().cancelled_owned());

        let dest = self.store.path_for(&request.hash, &request.extension());
        let temp = TempPath::new(partial_path_for(&dest));
        let partial = temp.path().to_path_buf();
        let expected = request.hash.clone();
        let mut reader = SyncIoBridge::new(StreamReader::new(Box::pin(body)));

        let decoded = tokio::task::spawn_blocking(move || -> Result<u64> {
            if let Some(parent) = partial.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(&partial)?;
            let (writer, written) = decode_frame_verified(&mut reader, BufWriter::new(file), &expected)?;
            writer.into_inner().map_err(|e| e.into_error())?;
            Ok(written)
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))
        .and_then(|r| r);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let written = match decoded {
            Ok(written) => written,
            Err(e) => {
                warn!(hash = %request.hash, error = %e, "direct download rejected");
                return Ok(DirectOutcome::Failed);
            }
        };

        temp.persist(&dest)?;
        match self.store.create(&dest, &request.hash) {
            Some(_) => {
                debug!(hash = %request.hash, bytes = written, "direct download stored");
                Ok(DirectOutcome::Succeeded)
            }
            None => {
                warn!(hash = %request.hash, path = %dest.display(), "stored file missing after placement");
                Ok(DirectOutcome::Failed)
            }
        }
    }
}
