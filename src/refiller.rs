/*!
 * The background task that maintains reservoir depth under the ordered
 * lease -> rate-limit -> credential -> dial acquisition chain
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ReservoirConfig;
use crate::credential::CredentialProvider;
use crate::dial::Dialer;
use crate::error::ReservoirError;
use crate::lease::LeaseManager;
use crate::physical_connection::{jittered_lifetime, PhysicalConnection};
use crate::rate_limiter::RateLimiter;
use crate::reservoir::Reservoir;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Maintains one [`Reservoir`] at its configured target depth. Owns no
/// connection state itself — every physical connection it dials is handed
/// to the reservoir immediately via `insert`.
///
/// `openOne`'s five steps (lease acquire, rate-limit wait, credential fetch,
/// physical dial, insert) run in this fixed order because reversing any
/// pair either leaks a lease or wastes rate-limit budget: acquiring the
/// lease first means a denied lease never consumes a rate-limit token;
/// fetching the credential only after the rate-limit wait means a busy
/// cluster never triggers a wasted credential fetch; dialing only after a
/// fresh credential is in hand means a dial never uses a stale token.
pub struct Refiller<D: Dialer> {
    reservoir: Arc<Reservoir<D::Conn>>,
    dialer: Arc<D>,
    credentials: Arc<dyn CredentialProvider>,
    rate_limiter: Arc<dyn RateLimiter>,
    lease_manager: Arc<LeaseManager>,
    dsn: String,
    target_ready: usize,
    low_watermark: usize,
    aggressive_batch: usize,
    base_lifetime: Duration,
    config: ReservoirConfig,
    cancel: CancellationToken,
    consecutive_failures: AtomicU32,
}

impl<D: Dialer> Refiller<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reservoir: Arc<Reservoir<D::Conn>>,
        dialer: Arc<D>,
        credentials: Arc<dyn CredentialProvider>,
        rate_limiter: Arc<dyn RateLimiter>,
        lease_manager: Arc<LeaseManager>,
        dsn: impl Into<String>,
        config: &ReservoirConfig,
    ) -> Arc<Self> {
        let cancel = reservoir.cancellation_token();
        Arc::new(Self {
            reservoir,
            dialer,
            credentials,
            rate_limiter,
            lease_manager,
            dsn: dsn.into(),
            target_ready: config.target_ready,
            low_watermark: config.low_watermark,
            aggressive_batch: config.aggressive_batch,
            base_lifetime: config.base_lifetime,
            config: config.clone(),
            cancel,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Runs until the reservoir's cancellation token fires. Intended to be
    /// `tokio::spawn`ed once per reservoir instance, alongside
    /// [`Reservoir::run_scanner`](crate::reservoir::Reservoir::run_scanner).
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let depth = self.reservoir.depth().await;
            if depth >= self.target_ready {
                if self.sleep_or_cancel(self.steady_sleep()).await {
                    return;
                }
                continue;
            }

            let batch = if depth < self.low_watermark {
                self.aggressive_batch
            } else {
                1
            };

            for _ in 0..batch {
                if self.cancel.is_cancelled() {
                    return;
                }
                self.open_one().await;
            }

            let depth_after = self.reservoir.depth().await;
            if self.sleep_or_cancel(self.pacing(depth_after)).await {
                return;
            }
        }
    }

    /// Blocks the caller until the reservoir reaches `low_watermark` depth
    /// or `timeout` elapses, whichever comes first. A timeout logs a
    /// warning and returns anyway rather than failing startup.
    pub async fn wait_for_initial_fill(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.reservoir.depth().await >= self.low_watermark {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    low_watermark = self.low_watermark,
                    "initial fill timed out before reaching low watermark; proceeding anyway"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn steady_sleep(&self) -> Duration {
        if self.target_ready == 0 {
            return self.base_lifetime;
        }
        self.base_lifetime / self.target_ready as u32
    }

    /// Warmup (depth below `low_watermark`) is paced only by the rate
    /// limiter inside `open_one`, so there is nothing extra to sleep for;
    /// steady state sleeps at the long-run replacement rate. Recomputed
    /// fresh after every batch — no hysteresis between the two modes.
    fn pacing(&self, depth: usize) -> Duration {
        if depth < self.low_watermark {
            Duration::ZERO
        } else {
            self.steady_sleep()
        }
    }

    async fn sleep_or_cancel(&self, dur: Duration) -> bool {
        if dur.is_zero() {
            return self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    /// Runs the ordered acquisition chain once. Every failure path releases
    /// whatever was already acquired before returning, so a cancelled or
    /// failed attempt never leaks a lease.
    async fn open_one(&self) {
        let lease_id = match self.lease_manager.acquire(&self.cancel).await {
            Ok(id) => id,
            Err(e) => {
                self.back_off("lease", &e).await;
                return;
            }
        };

        if let Err(e) = self.rate_limiter.wait(&self.cancel).await {
            self.lease_manager.release(&lease_id).await;
            self.back_off("rate_limit", &e).await;
            return;
        }

        let credential = match self.credentials.fetch_credential().await {
            Ok(c) => c,
            Err(e) => {
                self.lease_manager.release(&lease_id).await;
                self.back_off("credential", &e).await;
                return;
            }
        };

        let conn = match self.dialer.dial(&self.dsn, &credential).await {
            Ok(c) => c,
            Err(e) => {
                self.lease_manager.release(&lease_id).await;
                self.back_off("dial", &e).await;
                return;
            }
        };

        self.consecutive_failures.store(0, Ordering::Relaxed);

        let lifetime = jittered_lifetime(&self.config);
        let pc = PhysicalConnection::new(conn, tokio::time::Instant::now(), lifetime, Some(lease_id));
        // `Reservoir::insert` already discards (releasing the lease) on the
        // rare reservoir-full race with a concurrent return.
        self.reservoir.insert(pc).await;
    }

    async fn back_off(&self, cause: &'static str, err: &ReservoirError) {
        debug!(cause, error = %err, "refiller backing off");
        record_backoff(cause);

        if matches!(err, ReservoirError::Cancelled) {
            return;
        }

        let attempt = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = backoff_for(attempt);
        let _ = self.sleep_or_cancel(delay).await;
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(6));
    exp.min(BACKOFF_MAX)
}

#[cfg(feature = "metrics")]
fn record_backoff(cause: &'static str) {
    crate::metrics::metrics()
        .refiller_backoff_total
        .with_label_values(&[cause])
        .inc();
}

#[cfg(not(feature = "metrics"))]
fn record_backoff(_cause: &'static str) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::credential::StaticCredentialProvider;
    use crate::dial::test_support::{FakeConnection, FakeDialer};
    use crate::lease::InMemoryLeaseStore;
    use crate::rate_limiter::NoRateLimit;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};

    fn test_config(target_ready: usize, low_watermark: usize) -> ReservoirConfig {
        ReservoirConfig {
            target_ready,
            low_watermark,
            aggressive_batch: 2,
            base_lifetime: Duration::from_secs(600),
            lifetime_jitter: Duration::from_secs(60),
            guard_window: Duration::from_secs(30),
            ..Default::default()
        }
    }

    fn test_lease_manager(limit: u32) -> Arc<LeaseManager> {
        Arc::new(LeaseManager::new(
            Arc::new(InMemoryLeaseStore::new()),
            LeaseConfig {
                lease_enabled: true,
                lease_limit: limit,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn open_one_inserts_a_fresh_connection_with_a_lease() {
        let config = test_config(3, 1);
        let reservoir = Reservoir::<FakeConnection>::new(
            config.target_ready,
            config.guard_window,
            Duration::from_secs(1),
            test_lease_manager(10),
        );
        let refiller = Refiller::new(
            reservoir.clone(),
            Arc::new(FakeDialer::new()),
            Arc::new(StaticCredentialProvider::new("tok", Duration::from_secs(60))),
            Arc::new(NoRateLimit),
            test_lease_manager(10),
            "ignored",
            &config,
        );

        refiller.open_one().await;
        assert_eq!(reservoir.depth().await, 1);
    }

    #[tokio::test]
    async fn dial_failure_releases_the_lease_without_inserting() {
        let config = test_config(3, 1);
        let lease_manager = test_lease_manager(1);
        let reservoir = Reservoir::<FakeConnection>::new(
            config.target_ready,
            config.guard_window,
            Duration::from_secs(1),
            lease_manager.clone(),
        );
        let dialer = Arc::new(FakeDialer::new());
        dialer.fail.store(true, StdOrdering::SeqCst);

        let refiller = Refiller::new(
            reservoir.clone(),
            dialer,
            Arc::new(StaticCredentialProvider::new("tok", Duration::from_secs(60))),
            Arc::new(NoRateLimit),
            lease_manager.clone(),
            "ignored",
            &config,
        );

        refiller.open_one().await;
        assert_eq!(reservoir.depth().await, 0);

        // The lease from the failed attempt must have been released: the
        // limit-of-1 store should admit a brand new acquire.
        let cancel = CancellationToken::new();
        assert!(lease_manager.acquire(&cancel).await.is_ok());
    }

    #[tokio::test]
    async fn lease_limit_reached_does_not_consume_a_rate_limit_token() {
        let config = test_config(3, 1);
        let lease_manager = test_lease_manager(0);
        let reservoir = Reservoir::<FakeConnection>::new(
            config.target_ready,
            config.guard_window,
            Duration::from_secs(1),
            lease_manager.clone(),
        );

        struct CountingLimiter(AtomicBool);
        #[async_trait::async_trait]
        impl RateLimiter for CountingLimiter {
            async fn wait(&self, _cancel: &CancellationToken) -> crate::error::Result<()> {
                self.0.store(true, StdOrdering::SeqCst);
                Ok(())
            }
        }
        let limiter_touched = Arc::new(CountingLimiter(AtomicBool::new(false)));

        let refiller = Refiller::new(
            reservoir.clone(),
            Arc::new(FakeDialer::new()),
            Arc::new(StaticCredentialProvider::new("tok", Duration::from_secs(60))),
            limiter_touched.clone(),
            lease_manager,
            "ignored",
            &config,
        );

        refiller.open_one().await;
        assert_eq!(reservoir.depth().await, 0);
        assert!(!limiter_touched.0.load(StdOrdering::SeqCst));
    }

    #[tokio::test]
    async fn wait_for_initial_fill_returns_once_low_watermark_is_reached() {
        let config = test_config(3, 1);
        let reservoir = Reservoir::<FakeConnection>::new(
            config.target_ready,
            config.guard_window,
            Duration::from_secs(1),
            test_lease_manager(10),
        );
        let refiller = Refiller::new(
            reservoir.clone(),
            Arc::new(FakeDialer::new()),
            Arc::new(StaticCredentialProvider::new("tok", Duration::from_secs(60))),
            Arc::new(NoRateLimit),
            test_lease_manager(10),
            "ignored",
            &config,
        );

        let writer = reservoir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let pc = PhysicalConnection::new(
                FakeConnection::new(),
                tokio::time::Instant::now(),
                Duration::from_secs(600),
                Some("lease-1".into()),
            );
            writer.insert(pc).await;
        });

        refiller
            .wait_for_initial_fill(Duration::from_millis(500))
            .await;
        assert!(reservoir.depth().await >= 1);
    }

    #[tokio::test]
    async fn wait_for_initial_fill_times_out_on_a_persistently_empty_reservoir() {
        let config = test_config(3, 2);
        let reservoir = Reservoir::<FakeConnection>::new(
            config.target_ready,
            config.guard_window,
            Duration::from_secs(1),
            test_lease_manager(10),
        );
        let refiller = Refiller::new(
            reservoir.clone(),
            Arc::new(FakeDialer::new()),
            Arc::new(StaticCredentialProvider::new("tok", Duration::from_secs(60))),
            Arc::new(NoRateLimit),
            test_lease_manager(10),
            "ignored",
            &config,
        );

        let started = std::time::Instant::now();
        refiller
            .wait_for_initial_fill(Duration::from_millis(50))
            .await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(reservoir.depth().await, 0);
    }
}
