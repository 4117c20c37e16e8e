//! One physical fetch per hash.
//!
//! The first caller to [`Deduplicator::claim`] a hash becomes its owner;
//! later callers get a follower claim that observes the same outcome. Every
//! in-flight hash records which delivery path is currently responsible for
//! resolving it, and only that path can complete it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::data::ContentHash;

/// Which party may resolve an in-flight hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responsibility {
    /// Claimed but not yet routed to a delivery path.
    Unresolved,
    DirectOwned,
    QueueOwned,
}

/// Resolution of a claim, shared by its owner and every follower.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    rx: watch::Receiver<Option<bool>>,
}

impl ClaimOutcome {
    /// Wait until the claim is resolved and return whether the fetch
    /// succeeded.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// The outcome, if already resolved.
    pub fn peek(&self) -> Option<bool> { *self.rx.borrow() }
}

/// A caller's handle on one hash.
#[derive(Debug, Clone)]
pub struct DownloadClaim {
    hash: ContentHash,
    is_owner: bool,
    generation: u64,
    outcome: ClaimOutcome,
}

impl DownloadClaim {
    pub fn hash(&self) -> &ContentHash { &self.hash }

    pub fn is_owner(&self) -> bool { self.is_owner }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn outcome(&self) -> &ClaimOutcome { &self.outcome }
}

struct InFlight {
    tx: watch::Sender<Option<bool>>,
    responsibility: Responsibility,
    generation: u64,
    expiry: Option<AbortHandle>,
}

struct Inner {
    table: Mutex<HashMap<ContentHash, InFlight>>,
    next_generation: AtomicU64,
    expiry: Duration,
}

impl Inner {
    /// Remove and resolve `hash` if `accept` agrees. Returns whether it did.
    fn resolve_if(
        &self,
        hash: &ContentHash,
        generation: u64,
        success: bool,
        accept: impl FnOnce(&InFlight) -> bool,
    ) -> bool {
        let entry = {
            let mut table = self.table.lock();
            let matches = table
                .get(hash)
                .is_some_and(|entry| entry.generation == generation && accept(entry));
            if matches { table.remove(hash) } else { None }
        };
        let Some(entry) = entry else {
            return false;
        };
        if let Some(timer) = &entry.expiry {
            timer.abort();
        }
        entry.tx.send_replace(Some(success));
        true
    }
}

/// The in-flight table.
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct Deduplicator {
    inner: Arc<Inner>,
}

impl Deduplicator {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                expiry,
            }),
        }
    }

    /// Claim `hash`. The first caller since the last resolution becomes the
    /// owner and starts the expiry timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn claim(&self, hash: &ContentHash) -> DownloadClaim {
        let mut table = self.inner.table.lock();

        if let Some(entry) = table.get(hash) {
            return DownloadClaim {
                hash: hash.clone(),
                is_owner: false,
                generation: entry.generation,
                outcome: ClaimOutcome {
                    rx: entry.tx.subscribe(),
                },
            };
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let timer = spawn_expiry(Arc::downgrade(&self.inner), hash.clone(), generation, self.inner.expiry);
        table.insert(
            hash.clone(),
            InFlight {
                tx,
                responsibility: Responsibility::Unresolved,
                generation,
                expiry: Some(timer),
            },
        );
        debug!(%hash, generation, "claimed");

        DownloadClaim {
            hash: hash.clone(),
            is_owner: true,
            generation,
            outcome: ClaimOutcome { rx },
        }
    }

    /// Route an owned, unrouted claim to a delivery path.
    pub fn assign(&self, claim: &DownloadClaim, to: Responsibility) -> bool {
        self.transition(claim, Responsibility::Unresolved, to)
    }

    /// Pass resolution of a failed direct fetch to the queued path.
    pub fn hand_off(&self, claim: &DownloadClaim) -> bool {
        let moved = self.transition(claim, Responsibility::DirectOwned, Responsibility::QueueOwned);
        if moved {
            debug!(hash = %claim.hash, "handed off to queued path");
        }
        moved
    }

    fn transition(&self, claim: &DownloadClaim, from: Responsibility, to: Responsibility) -> bool {
        if !claim.is_owner {
            return false;
        }
        let mut table = self.inner.table.lock();
        match table.get_mut(&claim.hash) {
            Some(entry) if entry.generation == claim.generation && entry.responsibility == from => {
                entry.responsibility = to;
                true
            }
            _ => false,
        }
    }

    /// Resolve `claim` on behalf of `by`. Ignored unless `by` is the party
    /// currently responsible for this generation of the hash.
    pub fn complete(&self, claim: &DownloadClaim, by: Responsibility, success: bool) -> bool {
        if !claim.is_owner {
            return false;
        }
        let resolved = self
            .inner
            .resolve_if(&claim.hash, claim.generation, success, |entry| entry.responsibility == by);
        if resolved {
            debug!(hash = %claim.hash, ?by, success, "resolved");
        }
        resolved
    }

    /// Resolve an owned claim as failed whoever holds it. Used by sweeps
    /// once no path can still be working on it.
    pub fn abandon(&self, claim: &DownloadClaim) -> bool {
        if !claim.is_owner {
            return false;
        }
        let resolved = self.inner.resolve_if(&claim.hash, claim.generation, false, |_| true);
        if resolved {
            debug!(hash = %claim.hash, "abandoned");
        }
        resolved
    }

    /// Force-resolve everything in flight.
    pub fn complete_all(&self, success: bool) -> usize {
        let drained: Vec<(ContentHash, InFlight)> = self.inner.table.lock().drain().collect();
        for (_, entry) in &drained {
            if let Some(timer) = &entry.expiry {
                timer.abort();
            }
            entry.tx.send_replace(Some(success));
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), success, "resolved all in-flight claims");
        }
        drained.len()
    }

    pub fn responsibility(&self, hash: &ContentHash) -> Option<Responsibility> {
        self.inner.table.lock().get(hash).map(|e| e.responsibility)
    }

    pub fn is_in_flight(&self, hash: &ContentHash) -> bool { self.inner.table.lock().contains_key(hash) }

    pub fn in_flight_count(&self) -> usize { self.inner.table.lock().len() }
}

fn spawn_expiry(inner: Weak<Inner>, hash: ContentHash, generation: u64, after: Duration) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.resolve_if(&hash, generation, false, |_| true) {
            warn!(%hash, generation, "claim expired unresolved");
        }
    })
    .abort_handle()
}
