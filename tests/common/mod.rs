//! Test doubles shared across the integration scenarios in `tests/`.
//! Built against the crate's public surface only, since integration tests
//! compile as a separate crate and cannot see `pub(crate)` items.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conn_reservoir::{Capabilities, Connection, Dialer, ReservoirError};
use tokio_util::sync::CancellationToken;

pub struct FakeConn {
    pub healthy: Arc<AtomicBool>,
}

impl FakeConn {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl Connection for FakeConn {
    fn capabilities(&self) -> Capabilities {
        Capabilities::EXECUTE | Capabilities::PING
    }

    async fn execute(&self, _query: &str) -> conn_reservoir::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReservoirError::BadConnection("connection reset by peer".into()))
        }
    }

    async fn ping(&self) -> conn_reservoir::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReservoirError::BadConnection("connection reset by peer".into()))
        }
    }
}

pub struct FakeDialer {
    pub fail: Arc<AtomicBool>,
    pub dial_count: Arc<AtomicUsize>,
}

impl FakeDialer {
    pub fn new() -> Self {
        Self {
            fail: Arc::new(AtomicBool::new(false)),
            dial_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Conn = FakeConn;

    async fn dial(
        &self,
        _dsn: &str,
        _credential: &conn_reservoir::Credential,
    ) -> conn_reservoir::Result<FakeConn> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            Err(ReservoirError::Dial("refused".into()))
        } else {
            Ok(FakeConn::new())
        }
    }
}

/// A rate limiter that records whether it was ever consulted, used to
/// assert that a denied lease acquire never reaches the rate-limit step.
pub struct TrackingRateLimiter {
    pub touched: Arc<AtomicBool>,
}

impl TrackingRateLimiter {
    pub fn new() -> Self {
        Self {
            touched: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl conn_reservoir::RateLimiter for TrackingRateLimiter {
    async fn wait(&self, cancel: &CancellationToken) -> conn_reservoir::Result<()> {
        self.touched.store(true, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(ReservoirError::Cancelled);
        }
        Ok(())
    }
}
