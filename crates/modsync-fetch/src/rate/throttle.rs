//! Bandwidth limiting for response bodies.
//!
//! A [`BandwidthBroadcast`] holds the total ceiling and publishes the
//! per-transfer share over a `watch` channel. Every [`ThrottledStream`]
//! subscribes to it and picks up a new share on its next poll, so changing
//! the limit retargets transfers that are already running.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep, sleep};

use crate::data::BandwidthLimit;

/// Longest single pause, so a raised limit is noticed promptly.
const MAX_SLEEP: Duration = Duration::from_millis(100);

struct BroadcastState {
    limit: BandwidthLimit,
    active: usize,
}

struct BroadcastInner {
    state: Mutex<BroadcastState>,
    tx: watch::Sender<u64>,
}

impl BroadcastInner {
    fn publish(&self, state: &BroadcastState) {
        self.tx.send_replace(state.limit.per_slot(state.active));
    }
}

/// Shared bandwidth ceiling, split evenly across active transfers.
#[derive(Clone)]
pub struct BandwidthBroadcast {
    inner: Arc<BroadcastInner>,
}

impl BandwidthBroadcast {
    pub fn new(limit: BandwidthLimit) -> Self {
        let (tx, _) = watch::channel(limit.per_slot(0));
        Self {
            inner: Arc::new(BroadcastInner {
                state: Mutex::new(BroadcastState { limit, active: 0 }),
                tx,
            }),
        }
    }

    pub fn limit(&self) -> BandwidthLimit { self.inner.state.lock().limit }

    /// Change the total ceiling and retarget every active transfer.
    pub fn set_limit(&self, limit: BandwidthLimit) {
        let mut state = self.inner.state.lock();
        state.limit = limit;
        self.inner.publish(&state);
        tracing::debug!(
            bytes_per_second = limit.as_bytes_per_second(),
            active = state.active,
            "bandwidth limit changed"
        );
    }

    pub fn active(&self) -> usize { self.inner.state.lock().active }

    /// Current per-transfer share in bytes per second; 0 is unlimited.
    pub fn per_slot(&self) -> u64 { *self.inner.tx.borrow() }

    /// Wrap `stream` so it counts as an active transfer until dropped.
    pub fn throttle<S>(&self, stream: S) -> ThrottledStream<S> {
        let lease = self.lease();
        ThrottledStream::new(stream, self.inner.tx.subscribe()).with_lease(lease)
    }

    fn lease(&self) -> ThrottleLease {
        let mut state = self.inner.state.lock();
        state.active += 1;
        self.inner.publish(&state);
        ThrottleLease {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Marks one active transfer for the per-slot split.
struct ThrottleLease {
    inner: Arc<BroadcastInner>,
}

impl Drop for ThrottleLease {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.active = state.active.saturating_sub(1);
        self.inner.publish(&state);
    }
}

/// A byte stream that paces itself to a limit received over a `watch`
/// channel.
///
/// Each chunk pushes `next_allowed` forward by `len / rate`. When the rate
/// changes the outstanding wait is rescaled, so bytes already let through
/// stay paid for at whatever share the stream holds next.
pub struct ThrottledStream<S> {
    inner: S,
    limit_rx: watch::Receiver<u64>,
    rate: u64,
    next_allowed: Instant,
    delay: Option<Pin<Box<Sleep>>>,
    _lease: Option<ThrottleLease>,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, mut limit_rx: watch::Receiver<u64>) -> Self {
        let rate = *limit_rx.borrow_and_update();
        Self {
            inner,
            limit_rx,
            rate,
            next_allowed: Instant::now(),
            delay: None,
            _lease: None,
        }
    }

    fn with_lease(mut self, lease: ThrottleLease) -> Self {
        self._lease = Some(lease);
        // The lease changed the share after `new` read it.
        self.refresh_limit();
        self
    }

    /// The limit this stream is currently pacing to, in bytes per second.
    pub fn current_limit(&mut self) -> u64 {
        self.refresh_limit();
        self.rate
    }

    fn refresh_limit(&mut self) {
        if !self.limit_rx.has_changed().unwrap_or(false) {
            return;
        }
        let rate = *self.limit_rx.borrow_and_update();
        if rate == self.rate {
            return;
        }
        let now = Instant::now();
        let owed = self.next_allowed.saturating_duration_since(now);
        self.next_allowed = if rate == 0 || self.rate == 0 {
            now
        } else {
            now + owed.mul_f64(self.rate as f64 / rate as f64)
        };
        self.rate = rate;
        self.delay = None;
    }

    /// Time still owed for the bytes already let through.
    fn owed(&self) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        let wait = self.next_allowed.saturating_duration_since(Instant::now());
        (!wait.is_zero()).then_some(wait)
    }

    fn charge(&mut self, len: usize) {
        if self.rate == 0 {
            return;
        }
        let start = self.next_allowed.max(Instant::now());
        self.next_allowed = start + Duration::from_secs_f64(len as f64 / self.rate as f64);
    }
}

impl<S> Stream for ThrottledStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            this.refresh_limit();
            if let Some(delay) = this.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                this.delay = None;
            }
            match this.owed() {
                Some(wait) => this.delay = Some(Box::pin(sleep(wait.min(MAX_SLEEP)))),
                None => break,
            }
        }

        let item = ready!(Pin::new(&mut this.inner).poll_next(cx));
        if let Some(Ok(chunk)) = &item {
            this.charge(chunk.len());
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use futures_util::stream;

    fn chunks(n: usize, size: usize) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        stream::iter((0..n).map(move |_| Ok(Bytes::from(vec![0u8; size]))))
    }

    #[tokio::test]
    async fn test_unlimited_passes_through() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::UNLIMITED);
        let mut stream = broadcast.throttle(chunks(5, 10));
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paces_to_limit() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::bytes_per_second(1000));
        let start = Instant::now();
        let mut stream = broadcast.throttle(chunks(10, 100));
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        // The last chunk goes out once 900 bytes have been paid for.
        assert!(start.elapsed() >= Duration::from_millis(850), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_split_follows_active_count() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::bytes_per_second(900));
        let mut a = broadcast.throttle(chunks(1, 1));
        assert_eq!(a.current_limit(), 900);

        let mut b = broadcast.throttle(chunks(1, 1));
        let mut c = broadcast.throttle(chunks(1, 1));
        assert_eq!(broadcast.active(), 3);
        for s in [&mut a, &mut b, &mut c] {
            assert_eq!(s.current_limit(), 300);
        }

        drop(c);
        assert_eq!(broadcast.active(), 2);
        assert_eq!(a.current_limit(), 450);
        assert_eq!(b.current_limit(), 450);
    }

    #[tokio::test]
    async fn test_limit_change_reaches_every_active_stream() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::bytes_per_second(400));
        let mut streams: Vec<_> = (0..4).map(|_| broadcast.throttle(chunks(1, 1))).collect();
        for s in &mut streams {
            assert_eq!(s.current_limit(), 100);
        }

        broadcast.set_limit(BandwidthLimit::bytes_per_second(4000));
        for s in &mut streams {
            assert_eq!(s.current_limit(), 1000);
        }

        broadcast.set_limit(BandwidthLimit::UNLIMITED);
        for s in &mut streams {
            assert_eq!(s.current_limit(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_holds_while_other_transfers_come_and_go() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::bytes_per_second(10_000));
        let mut stream = broadcast.throttle(chunks(10, 10_000));

        let churn = broadcast.clone();
        let churner = tokio::spawn(async move {
            loop {
                let other = churn.throttle(chunks(0, 0));
                sleep(Duration::from_millis(25)).await;
                drop(other);
                sleep(Duration::from_millis(25)).await;
            }
        });

        let start = Instant::now();
        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        churner.abort();

        // Nine chunks are paid for at no more than the full 10 000 B/s.
        assert!(start.elapsed() >= Duration::from_secs(9), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_change_rescales_outstanding_wait() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::bytes_per_second(1000));
        let mut stream = broadcast.throttle(chunks(2, 1000));
        stream.next().await.unwrap().unwrap();
        assert_eq!(stream.owed(), Some(Duration::from_secs(1)));

        // Halving the share doubles what the stream still owes.
        let other = broadcast.throttle(chunks(0, 0));
        assert_eq!(stream.current_limit(), 500);
        assert_eq!(stream.owed(), Some(Duration::from_secs(2)));

        drop(other);
        assert_eq!(stream.current_limit(), 1000);
        assert_eq!(stream.owed(), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_limit_unblocks_in_flight_stream() {
        let broadcast = BandwidthBroadcast::new(BandwidthLimit::bytes_per_second(10));
        let mut stream = broadcast.throttle(chunks(3, 100));

        // First chunk is free; the second would owe ten seconds at 10 B/s.
        stream.next().await.unwrap().unwrap();
        let start = Instant::now();

        let raise = broadcast.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            raise.set_limit(BandwidthLimit::UNLIMITED);
        });

        while let Some(chunk) = stream.next().await {
            chunk.unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    }
}
