/*!
 * The physical connection wrapper tracked internally by the reservoir
 */

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::ReservoirConfig;

/// An authenticated physical connection plus the bookkeeping the reservoir
/// needs to retire it safely. Mirrors the role `PooledConnection<T>` plays
/// in a generic connection pool, but the lifetime here is fixed at creation
/// time rather than recomputed from `idle_timeout`/`max_lifetime` on every
/// check, since the design calls for this being an immutable property of
/// the connection once dialed.
pub struct PhysicalConnection<C> {
    pub(crate) conn: C,
    created_at: Instant,
    lifetime: Duration,
    lease_id: Option<String>,
}

impl<C> PhysicalConnection<C> {
    /// Wrap a freshly dialed connection. `lifetime` should already include
    /// jitter; use [`jittered_lifetime`] to sample it from a config.
    pub fn new(conn: C, now: Instant, lifetime: Duration, lease_id: Option<String>) -> Self {
        Self {
            conn,
            created_at: now,
            lifetime,
            lease_id,
        }
    }

    pub fn lease_id(&self) -> Option<&str> {
        self.lease_id.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Time remaining before this connection reaches the end of its
    /// lifetime, saturating at zero rather than going negative.
    pub fn remaining(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.created_at);
        self.lifetime.saturating_sub(elapsed)
    }

    /// True once the connection has passed its lifetime outright.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    /// True if at most `guard_window` remains — unsafe to hand out or accept
    /// back, since the caller might not finish its unit of work before the
    /// connection is torn down server-side. Matches spec's strict
    /// `now < created_at + lifetime - guard_window` safety condition: safe
    /// requires remaining lifetime strictly greater than the guard window.
    pub fn is_within_guard_window(&self, now: Instant, guard_window: Duration) -> bool {
        self.remaining(now) <= guard_window
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

/// Sample a connection lifetime as `base_lifetime + Uniform(0, lifetime_jitter)`,
/// spreading expirations so the refiller never has to replace a synchronized
/// batch all at once.
pub fn jittered_lifetime(config: &ReservoirConfig) -> Duration {
    if config.lifetime_jitter.is_zero() {
        return config.base_lifetime;
    }
    let jitter_millis = config.lifetime_jitter.as_millis() as u64;
    let extra = rand::rng().random_range(0..=jitter_millis);
    config.base_lifetime + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_saturates_at_zero() {
        let now = Instant::now();
        let pc = PhysicalConnection::new("conn", now, Duration::from_secs(5), None);
        let later = now + Duration::from_secs(10);
        assert_eq!(pc.remaining(later), Duration::ZERO);
        assert!(pc.is_expired(later));
    }

    #[test]
    fn guard_window_trips_before_full_expiry() {
        let now = Instant::now();
        let pc = PhysicalConnection::new("conn", now, Duration::from_secs(60), None);
        let almost_done = now + Duration::from_secs(50);
        assert!(!pc.is_expired(almost_done));
        assert!(pc.is_within_guard_window(almost_done, Duration::from_secs(15)));
    }

    #[test]
    fn jittered_lifetime_stays_within_bounds() {
        let config = ReservoirConfig {
            base_lifetime: Duration::from_secs(600),
            lifetime_jitter: Duration::from_secs(120),
            ..Default::default()
        };
        for _ in 0..100 {
            let lifetime = jittered_lifetime(&config);
            assert!(lifetime >= config.base_lifetime);
            assert!(lifetime <= config.base_lifetime + config.lifetime_jitter);
        }
    }

    #[test]
    fn zero_jitter_returns_base_lifetime_exactly() {
        let config = ReservoirConfig {
            base_lifetime: Duration::from_secs(600),
            lifetime_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(jittered_lifetime(&config), config.base_lifetime);
    }
}
