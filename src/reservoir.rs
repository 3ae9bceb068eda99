/*!
 * The bounded, pre-warmed buffer of ready physical connections
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dial::Connection;
use crate::error::DiscardReason;
use crate::lease::LeaseManager;
use crate::physical_connection::PhysicalConnection;

/// A point-in-time snapshot of reservoir occupancy, the equivalent of
/// `PoolStats` in a generic connection pool.
#[derive(Debug, Clone, Copy)]
pub struct ReservoirStats {
    pub ready: usize,
    pub target_ready: usize,
}

impl ReservoirStats {
    pub fn utilization(&self) -> f64 {
        if self.target_ready == 0 {
            0.0
        } else {
            self.ready as f64 / self.target_ready as f64
        }
    }
}

/// The bounded FIFO of pre-created, authenticated physical connections. The
/// only large piece of shared mutable state in the design; everything else
/// (counters, cancellation) is atomic or owned by the external lease store.
pub struct Reservoir<C: Connection + 'static> {
    ready: Mutex<VecDeque<PhysicalConnection<C>>>,
    notify: Notify,
    cancel: CancellationToken,
    lease_manager: Arc<LeaseManager>,
    target_ready: usize,
    guard_window: Duration,
    scan_interval: Duration,
    shutting_down: AtomicBool,
    checkout_hits: AtomicU64,
    checkout_misses: AtomicU64,
}

impl<C: Connection + 'static> Reservoir<C> {
    pub fn new(
        target_ready: usize,
        guard_window: Duration,
        scan_interval: Duration,
        lease_manager: Arc<LeaseManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(VecDeque::with_capacity(target_ready)),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            lease_manager,
            target_ready,
            guard_window,
            scan_interval,
            shutting_down: AtomicBool::new(false),
            checkout_hits: AtomicU64::new(0),
            checkout_misses: AtomicU64::new(0),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn target_ready(&self) -> usize {
        self.target_ready
    }

    pub async fn depth(&self) -> usize {
        self.ready.lock().await.len()
    }

    pub async fn stats(&self) -> ReservoirStats {
        ReservoirStats {
            ready: self.depth().await,
            target_ready: self.target_ready,
        }
    }

    /// Non-blocking pop. Constant-time on the hot path: a single lock
    /// acquisition plus a bounded number of guard-window checks, never an
    /// await on I/O.
    pub async fn checkout(&self, now: Instant) -> Option<PhysicalConnection<C>> {
        if self.shutting_down.load(Ordering::Acquire) {
            self.record_checkout(false);
            return None;
        }

        let mut ready = self.ready.lock().await;
        let depth = ready.len();
        for _ in 0..depth {
            let pc = match ready.pop_front() {
                Some(pc) => pc,
                None => break,
            };
            if let Some(reason) = guard_violation_reason(&pc, now, self.guard_window, true) {
                self.discard(pc, reason);
                continue;
            }
            let depth_after = ready.len();
            drop(ready);
            record_depth_metric(depth_after);
            self.record_checkout(true);
            return Some(pc);
        }
        let depth_after = ready.len();
        drop(ready);
        record_depth_metric(depth_after);
        self.record_checkout(false);
        None
    }

    /// Tries the non-blocking path first; on an empty buffer, waits up to
    /// `max_wait` for a push notification before giving up. `max_wait` is
    /// meant to smooth over transient emptiness, not to throttle callers.
    pub async fn blocking_checkout(&self, max_wait: Duration) -> Option<PhysicalConnection<C>> {
        if let Some(pc) = self.checkout(Instant::now()).await {
            return Some(pc);
        }

        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(max_wait) => return None,
            _ = self.cancel.cancelled() => return None,
        }

        self.checkout(Instant::now()).await
    }

    /// Non-blocking push. Discards instead of blocking when the connection
    /// is poisoned, unsafe, or the buffer is full.
    pub async fn return_conn(&self, pc: PhysicalConnection<C>, now: Instant) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.discard(pc, DiscardReason::Shutdown);
            return;
        }

        if let Some(reason) = guard_violation_reason(&pc, now, self.guard_window, false) {
            self.discard(pc, reason);
            return;
        }

        let mut ready = self.ready.lock().await;
        if ready.len() >= self.target_ready {
            drop(ready);
            self.discard(pc, DiscardReason::ReservoirFull);
            return;
        }
        ready.push_back(pc);
        let depth_after = ready.len();
        drop(ready);
        record_depth_metric(depth_after);
        self.notify.notify_one();
    }

    /// Pushes a freshly dialed connection from the refiller. Identical
    /// contract to [`Reservoir::return_conn`] minus the guard-window check
    /// (a connection fresh off the dial is always within its guard window
    /// by construction), kept as a separate entry point so the refiller's
    /// call site reads as "insert", not "return".
    pub async fn insert(&self, pc: PhysicalConnection<C>) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            self.discard(pc, DiscardReason::Shutdown);
            return false;
        }

        let mut ready = self.ready.lock().await;
        if ready.len() >= self.target_ready {
            drop(ready);
            warn!("refiller push found reservoir full, discarding fresh connection");
            self.discard(pc, DiscardReason::ReservoirFull);
            return false;
        }
        ready.push_back(pc);
        let depth_after = ready.len();
        drop(ready);
        record_depth_metric(depth_after);
        self.notify.notify_one();
        true
    }

    /// Closes the underlying connection (by dropping it) and releases its
    /// lease, if any, on a background task so the caller never blocks on
    /// lease-store I/O. Synchronous and non-blocking by design — this is
    /// what keeps checkout/return on the hot path.
    pub(crate) fn discard(&self, pc: PhysicalConnection<C>, reason: DiscardReason) {
        debug!(reason = %reason, "discarding connection");
        record_discard(reason);

        if let Some(lease_id) = pc.lease_id().map(str::to_owned) {
            let lease_manager = self.lease_manager.clone();
            tokio::spawn(async move {
                lease_manager.release(&lease_id).await;
            });
        }
        // `pc` drops here, closing the underlying connection.
    }

    fn record_checkout(&self, hit: bool) {
        if hit {
            self.checkout_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkout_misses.fetch_add(1, Ordering::Relaxed);
        }
        record_checkout_metric(hit);
    }

    /// Takes a bounded snapshot of the buffer via successive non-blocking
    /// pops, evicts anything that has crossed the guard window, and pushes
    /// survivors back in original order — preserving FIFO for the
    /// connections that remain. Runs under the same lock as checkout/return,
    /// so it never races a concurrent pop against its own pops.
    async fn scan_once(&self, now: Instant) {
        let mut ready = self.ready.lock().await;
        let depth = ready.len();
        let mut survivors = VecDeque::with_capacity(depth);
        let mut evicted = Vec::new();

        for _ in 0..depth {
            let pc = match ready.pop_front() {
                Some(pc) => pc,
                None => break,
            };
            if pc.is_within_guard_window(now, self.guard_window) {
                evicted.push(pc);
            } else {
                survivors.push_back(pc);
            }
        }

        *ready = survivors;
        let depth_after = ready.len();
        drop(ready);
        record_depth_metric(depth_after);

        for pc in evicted {
            self.discard(pc, DiscardReason::ScannerEvicted);
        }
    }

    /// Runs the periodic expiry scan until the reservoir's cancellation
    /// token fires, then performs the shutdown drain. Intended to be
    /// `tokio::spawn`ed once per reservoir instance.
    pub async fn run_scanner(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.scan_interval) => {
                    self.scan_once(Instant::now()).await;
                }
                _ = self.cancel.cancelled() => {
                    self.drain_on_shutdown().await;
                    return;
                }
            }
        }
    }

    /// Stops accepting pushes and drains every buffered connection with
    /// reason `shutdown`. Idempotent: a second call observes an already
    /// empty, already-stopped buffer and does nothing.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.drain_on_shutdown().await;
    }

    async fn drain_on_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut ready = self.ready.lock().await;
        let drained: Vec<_> = ready.drain(..).collect();
        drop(ready);
        record_depth_metric(0);
        for pc in drained {
            self.discard(pc, DiscardReason::Shutdown);
        }
        info!("reservoir drained on shutdown");
    }
}

fn guard_violation_reason<C>(
    pc: &PhysicalConnection<C>,
    now: Instant,
    guard_window: Duration,
    on_checkout: bool,
) -> Option<DiscardReason> {
    let remaining = pc.remaining(now);
    if remaining.is_zero() {
        Some(if on_checkout {
            DiscardReason::ExpiredOnCheckout
        } else {
            DiscardReason::ExpiredOnReturn
        })
    } else if remaining <= guard_window {
        Some(DiscardReason::InsufficientRemainingLifetime)
    } else {
        None
    }
}

#[cfg(feature = "metrics")]
fn record_checkout_metric(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    crate::metrics::metrics()
        .checkouts_total
        .with_label_values(&[label])
        .inc();
}

#[cfg(not(feature = "metrics"))]
fn record_checkout_metric(_hit: bool) {}

#[cfg(feature = "metrics")]
fn record_depth_metric(depth: usize) {
    crate::metrics::metrics().depth.set(depth as i64);
}

#[cfg(not(feature = "metrics"))]
fn record_depth_metric(_depth: usize) {}

#[cfg(feature = "metrics")]
fn record_discard(reason: DiscardReason) {
    crate::metrics::metrics()
        .discards_total
        .with_label_values(&[reason.as_str()])
        .inc();
}

#[cfg(not(feature = "metrics"))]
fn record_discard(_reason: DiscardReason) {}
