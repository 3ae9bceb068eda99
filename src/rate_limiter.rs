/*!
 * Cluster-wide rate limiter abstraction
 *
 * The reservoir treats the rate limiter as an opaque external collaborator:
 * a plain trait boundary plus a built-in `governor`-backed implementation
 * behind a feature flag.
 */

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ReservoirError, Result};

/// Waits for permission to dial one new physical connection. Implementations
/// are expected to be cluster-wide (shared across reservoirs and processes)
/// but the reservoir only ever sees this narrow interface.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Blocks until a token is available or `cancel` fires.
    async fn wait(&self, cancel: &CancellationToken) -> Result<()>;
}

/// A rate limiter that never throttles. Useful for tests and for
/// deployments where the cluster-wide limit is enforced upstream (e.g. at
/// the credential provider).
pub struct NoRateLimit;

#[async_trait]
impl RateLimiter for NoRateLimit {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ReservoirError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(feature = "governor-rate-limit")]
pub mod governor_impl {
    use super::*;
    use governor::{
        clock::DefaultClock,
        state::{InMemoryState, NotKeyed},
        Quota, RateLimiter as GovernorLimiter,
    };
    use std::num::NonZeroU32;

    /// A `governor`-backed token-bucket limiter, shared across every
    /// refiller in the process that is handed the same instance.
    pub struct GovernorRateLimiter {
        inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    }

    impl GovernorRateLimiter {
        /// `connections_per_second` is the cluster-wide new-connection rate
        /// budget (e.g. 100). Bursts up to the same size are allowed.
        pub fn new(connections_per_second: u32) -> Self {
            let per_second =
                NonZeroU32::new(connections_per_second).expect("rate must be non-zero");
            let quota = Quota::per_second(per_second).allow_burst(per_second);
            Self {
                inner: GovernorLimiter::direct(quota),
            }
        }
    }

    #[async_trait]
    impl RateLimiter for GovernorRateLimiter {
        async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
            tokio::select! {
                _ = self.inner.until_ready() => Ok(()),
                _ = cancel.cancelled() => Err(ReservoirError::Cancelled),
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_rate_limit_never_blocks() {
        let limiter = NoRateLimit;
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn no_rate_limit_respects_preexisting_cancellation() {
        let limiter = NoRateLimit;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter.wait(&cancel).await;
        assert!(matches!(result, Err(ReservoirError::Cancelled)));
    }
}
