/*!
 * Driver façade — adapts the application pool's open/close surface onto
 * reservoir checkout/return operations
 */

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::dial::Connection;
use crate::error::{ReservoirError, Result};
use crate::handle::Handle;
use crate::reservoir::Reservoir;

/// The single operation a host connection pool understands. Mirrors the
/// standard database-pool convention: `Open` either returns a usable
/// connection or a sentinel the pool is expected to treat as a retryable
/// bad-connection signal.
///
/// The `dsn` parameter is accepted for interface compatibility only and is
/// always ignored — every physical connection behind the reservoir has
/// already been dialed by the refiller with a fresh credential.
pub struct Driver<C: Connection + 'static> {
    reservoir: Arc<Reservoir<C>>,
    blocking_checkout_wait: Duration,
}

impl<C: Connection + 'static> Driver<C> {
    pub fn new(reservoir: Arc<Reservoir<C>>, blocking_checkout_wait: Duration) -> Self {
        Self {
            reservoir,
            blocking_checkout_wait,
        }
    }

    /// Opens a connection, ignoring `_dsn`. Tries the non-blocking checkout
    /// first; on an empty buffer, waits up to `blocking_checkout_wait` for
    /// the refiller (or a concurrent return) to populate it. Returns
    /// [`ReservoirError::TransientUnavailable`] if the buffer is still empty
    /// past that bound — the caller is expected to retry, per the standard
    /// "bad connection" convention.
    pub async fn open(&self, _dsn: &str) -> Result<Handle<C>> {
        let now = Instant::now();

        if let Some(pc) = self.reservoir.checkout(now).await {
            return Ok(Handle::new(self.reservoir.clone(), pc));
        }

        if let Some(pc) = self
            .reservoir
            .blocking_checkout(self.blocking_checkout_wait)
            .await
        {
            return Ok(Handle::new(self.reservoir.clone(), pc));
        }

        Err(ReservoirError::TransientUnavailable(
            self.blocking_checkout_wait,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use crate::dial::test_support::FakeConnection;
    use crate::lease::{InMemoryLeaseStore, LeaseManager};
    use crate::physical_connection::PhysicalConnection;

    fn test_reservoir(target_ready: usize) -> Arc<Reservoir<FakeConnection>> {
        let lease_manager = Arc::new(LeaseManager::new(
            Arc::new(InMemoryLeaseStore::new()),
            LeaseConfig {
                lease_enabled: true,
                lease_limit: 10,
                ..Default::default()
            },
        ));
        Reservoir::new(
            target_ready,
            Duration::from_secs(45),
            Duration::from_secs(1),
            lease_manager,
        )
    }

    #[tokio::test]
    async fn open_returns_a_ready_connection_immediately() {
        let reservoir = test_reservoir(2);
        let pc = PhysicalConnection::new(
            FakeConnection::new(),
            Instant::now(),
            Duration::from_secs(600),
            Some("lease-1".into()),
        );
        reservoir.insert(pc).await;

        let driver = Driver::new(reservoir, Duration::from_millis(100));
        let handle = driver.open("ignored-dsn").await.unwrap();
        assert!(!handle.is_poisoned());
    }

    #[tokio::test]
    async fn open_on_empty_reservoir_eventually_returns_transient_unavailable() {
        let reservoir = test_reservoir(2);
        let driver = Driver::new(reservoir, Duration::from_millis(20));
        let result = driver.open("ignored-dsn").await;
        assert!(matches!(
            result,
            Err(ReservoirError::TransientUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn open_observes_a_connection_that_arrives_during_the_blocking_wait() {
        let reservoir = test_reservoir(2);
        let writer = reservoir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let pc = PhysicalConnection::new(
                FakeConnection::new(),
                Instant::now(),
                Duration::from_secs(600),
                Some("late".into()),
            );
            writer.insert(pc).await;
        });

        let driver = Driver::new(reservoir, Duration::from_millis(500));
        let handle = driver.open("ignored-dsn").await.unwrap();
        assert!(!handle.is_poisoned());
    }

    #[tokio::test]
    async fn dsn_argument_is_ignored() {
        let reservoir = test_reservoir(1);
        let pc = PhysicalConnection::new(
            FakeConnection::new(),
            Instant::now(),
            Duration::from_secs(600),
            Some("lease-1".into()),
        );
        reservoir.insert(pc).await;

        let driver = Driver::new(reservoir, Duration::from_millis(50));
        assert!(driver.open("postgres://anything/whatsoever").await.is_ok());
    }
}
