/*!
 * conn-reservoir - Rate-limit-aware, pre-warmed connection reservoir
 *
 * Sits between a cluster-wide connection-creation rate limit and an
 * application connection pool's bursty demand. Maintains a bounded buffer
 * of authenticated physical connections so that checkout on the request
 * path is a non-blocking buffer read, while all rate-limited, blocking, and
 * failure-prone work — credential refresh, rate-limiter waits, distributed
 * lease acquisition, physical dial — is confined to a background refiller.
 *
 * Five components, each its own module:
 * - [`reservoir`]: the bounded FIFO plus checkout/return/discard/scan.
 * - [`handle`]: the capability-probing wrapper returned on checkout.
 * - [`driver`]: the façade a host connection pool's `Open` calls through.
 * - [`refiller`]: the background task running the ordered acquisition chain.
 * - [`lease`]: the distributed lease manager bounding cluster-wide leases.
 */

pub mod config;
pub mod credential;
pub mod dial;
pub mod driver;
pub mod error;
pub mod handle;
pub mod lease;
pub mod logging;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod physical_connection;
pub mod rate_limiter;
pub mod refiller;
pub mod reservoir;

pub use config::{LeaseConfig, ReservoirConfig};
pub use credential::{Credential, CredentialProvider, StaticCredentialProvider};
pub use dial::{Capabilities, Connection, Dialer};
pub use driver::Driver;
pub use error::{DiscardReason, ReservoirError, Result};
pub use handle::Handle;
pub use lease::{InMemoryLeaseStore, LeaseManager, LeaseStore, LeaseStoreError};
pub use physical_connection::PhysicalConnection;
pub use rate_limiter::{NoRateLimit, RateLimiter};
pub use refiller::Refiller;
pub use reservoir::{Reservoir, ReservoirStats};

#[cfg(feature = "governor-rate-limit")]
pub use rate_limiter::governor_impl::GovernorRateLimiter;

#[cfg(feature = "dynamodb-lease")]
pub use lease::dynamodb_impl::DynamoDbLeaseStore;

use std::sync::Arc;

/// Wires the five components into one running reservoir: constructs the
/// [`Reservoir`], spawns its expiry scanner, builds the [`Refiller`] on top
/// of the supplied collaborators and spawns it, and returns a [`Driver`]
/// ready for the host connection pool's `Open` calls.
///
/// This is a convenience constructor, not a hidden requirement — callers
/// who want direct control over task spawning or lifecycle can build the
/// same pieces by hand from the public modules instead.
pub fn start<D: Dialer + 'static>(
    config: ReservoirConfig,
    dialer: Arc<D>,
    credentials: Arc<dyn CredentialProvider>,
    rate_limiter: Arc<dyn RateLimiter>,
    lease_store: Arc<dyn LeaseStore>,
    dsn: impl Into<String>,
) -> Result<Driver<D::Conn>> {
    config.validate()?;

    let lease_manager = Arc::new(LeaseManager::new(lease_store, config.lease.clone()));
    let reservoir = Reservoir::new(
        config.target_ready,
        config.guard_window,
        config.scan_interval,
        lease_manager.clone(),
    );

    tokio::spawn(reservoir.clone().run_scanner());

    let refiller = Refiller::new(
        reservoir.clone(),
        dialer,
        credentials,
        rate_limiter,
        lease_manager,
        dsn,
        &config,
    );
    tokio::spawn(refiller.run());

    Ok(Driver::new(reservoir, config.blocking_checkout_wait))
}
