/*!
 * Error types for the connection reservoir
 */

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReservoirError>;

/// The reservoir's error taxonomy.
///
/// This mirrors the kinds-not-types distinction the design calls for: most
/// variants never leave the refiller or lease manager. Only
/// [`ReservoirError::TransientUnavailable`] and [`ReservoirError::Poisoned`]
/// are meant to reach the host connection pool.
#[derive(Debug, Error)]
pub enum ReservoirError {
    /// The reservoir was empty past `blocking_checkout_wait`. The host pool
    /// is expected to treat this as a retryable bad-connection signal.
    #[error("reservoir has no ready connection after {0:?}")]
    TransientUnavailable(Duration),

    /// Cluster-wide lease limit exhausted. Never escapes the refiller.
    #[error("lease limit reached")]
    LimitReached,

    /// The rate limiter declined or was cancelled while waiting for a token.
    #[error("rate limited")]
    RateLimited,

    /// The credential provider failed to produce a fresh token.
    #[error("credential fetch failed: {0}")]
    Credential(String),

    /// The underlying dial function failed to establish a physical
    /// connection.
    #[error("dial failed: {0}")]
    Dial(String),

    /// A forwarded capability call on a [`crate::handle::Handle`] observed a
    /// bad-connection signal. The handle is poisoned; the wrapped cause is
    /// surfaced to the caller unchanged.
    #[error("connection poisoned: {0}")]
    Poisoned(Box<ReservoirError>),

    /// The distributed lease store is unreachable.
    #[error("lease store unavailable")]
    LeaseStoreUnavailable,

    /// A forwarded capability call, or an opportunistic `validate`, reported
    /// the underlying physical connection as unhealthy. The cause the
    /// handle wraps in [`ReservoirError::Poisoned`] when it poisons itself.
    #[error("bad connection signal: {0}")]
    BadConnection(String),

    /// A blocking or background operation observed cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration was rejected at load or validation time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A programmer error: nil handle, double shutdown, or similar
    /// precondition violation. Not meant to be handled — propagate or panic.
    #[error("fatal reservoir error: {0}")]
    Fatal(String),
}

impl ReservoirError {
    /// Worth retrying after a short backoff (refiller-internal categories).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReservoirError::LimitReached
                | ReservoirError::RateLimited
                | ReservoirError::Credential(_)
                | ReservoirError::Dial(_)
                | ReservoirError::LeaseStoreUnavailable
                | ReservoirError::Cancelled
        )
    }

    /// A programmer error that should not be retried or swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReservoirError::Fatal(_) | ReservoirError::Config(_))
    }

    /// Whether a forwarded capability call failing with this error means the
    /// physical connection itself is bad, matching the `driver.ErrBadConn`
    /// convention §4.2/§7 call for: an ordinary statement-level error must
    /// not retire an otherwise-healthy connection, only this kind should.
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, ReservoirError::BadConnection(_))
    }

    /// Whether the refiller should back off before its next attempt, as
    /// opposed to retrying immediately (e.g. after a cancellation, which is
    /// shutdown-driven and should not be paced).
    pub fn should_trip_backoff(&self) -> bool {
        matches!(
            self,
            ReservoirError::LimitReached
                | ReservoirError::RateLimited
                | ReservoirError::Credential(_)
                | ReservoirError::Dial(_)
                | ReservoirError::LeaseStoreUnavailable
        )
    }

    /// Discard reason this error would be logged/counted under, if it
    /// terminates a checkout or return rather than a refill attempt.
    pub fn as_discard_reason(&self) -> Option<DiscardReason> {
        match self {
            ReservoirError::Poisoned(_) => Some(DiscardReason::Poisoned),
            _ => None,
        }
    }
}

/// Closed set of reasons a [`crate::physical_connection::PhysicalConnection`]
/// can be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    ExpiredOnCheckout,
    ExpiredOnReturn,
    InsufficientRemainingLifetime,
    ReservoirFull,
    Poisoned,
    ScannerEvicted,
    Shutdown,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::ExpiredOnCheckout => "expired_on_checkout",
            DiscardReason::ExpiredOnReturn => "expired_on_return",
            DiscardReason::InsufficientRemainingLifetime => "insufficient_remaining_lifetime",
            DiscardReason::ReservoirFull => "reservoir_full",
            DiscardReason::Poisoned => "poisoned",
            DiscardReason::ScannerEvicted => "scanner_evicted",
            DiscardReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
