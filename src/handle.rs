/*!
 * The handle wrapper returned to the application on checkout
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::dial::{Capabilities, Connection};
use crate::error::{ReservoirError, Result};
use crate::physical_connection::PhysicalConnection;
use crate::reservoir::Reservoir;

/// Wraps one checked-out [`PhysicalConnection`]. Forwards whichever
/// capabilities the underlying connection advertised at wrap time — probed
/// once, never assumed — and routes `close` to either `Reservoir::return_conn`
/// or `Reservoir::discard` depending on whether any forwarded call observed
/// a bad-connection signal.
///
/// A handle holds a reference to its reservoir; the reservoir holds no
/// reference back. A leaked handle cannot keep the reservoir alive past
/// shutdown — the graph is a tree, not a cycle.
pub struct Handle<C: Connection + 'static> {
    reservoir: Arc<Reservoir<C>>,
    pc: Mutex<Option<PhysicalConnection<C>>>,
    capabilities: Capabilities,
    closed: AtomicBool,
    poisoned: AtomicBool,
}

impl<C: Connection + 'static> Handle<C> {
    pub(crate) fn new(reservoir: Arc<Reservoir<C>>, pc: PhysicalConnection<C>) -> Self {
        let capabilities = pc.conn.capabilities();
        Self {
            reservoir,
            pc: Mutex::new(Some(pc)),
            capabilities,
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn execute(&self, query: &str) -> Result<()> {
        self.forward(Capabilities::EXECUTE, "execute", |conn| conn.execute(query))
            .await
    }

    pub async fn prepare(&self, query: &str) -> Result<()> {
        self.forward(Capabilities::PREPARE, "prepare", |conn| conn.prepare(query))
            .await
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        self.forward(Capabilities::BEGIN_TRANSACTION, "begin_transaction", |conn| {
            conn.begin_transaction()
        })
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.forward(Capabilities::PING, "ping", |conn| conn.ping())
            .await
    }

    pub async fn reset_session(&self) -> Result<()> {
        self.forward(Capabilities::RESET_SESSION, "reset_session", |conn| {
            conn.reset_session()
        })
        .await
    }

    /// An unhealthy (`Ok(false)`) result is treated as a bad-connection
    /// signal and poisons the handle, same as a hard error from any other
    /// forwarded capability.
    pub async fn validate(&self) -> Result<bool> {
        if !self.capabilities.contains(Capabilities::VALIDATE) {
            return Err(not_supported("validate"));
        }

        let guard = self.pc.lock().await;
        let pc = guard
            .as_ref()
            .ok_or_else(|| ReservoirError::Fatal("handle already closed".into()))?;
        let result = pc.conn.validate().await;
        drop(guard);

        match result {
            Ok(true) => Ok(true),
            Ok(false) => Err(self.poison(ReservoirError::BadConnection(
                "validate reported an unhealthy connection".into(),
            ))),
            Err(e) => Err(self.poison(e)),
        }
    }

    async fn forward<F, Fut>(&self, required: Capabilities, name: &'static str, op: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a C) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if !self.capabilities.contains(required) {
            return Err(not_supported(name));
        }

        let guard = self.pc.lock().await;
        let pc = guard
            .as_ref()
            .ok_or_else(|| ReservoirError::Fatal("handle already closed".into()))?;
        let result = op(&pc.conn).await;
        drop(guard);

        result.map_err(|e| {
            // Only a bad-connection signal retires the physical connection —
            // matching `driver.ErrBadConn`, an ordinary statement-level error
            // (a bad query, a constraint violation) leaves the connection
            // healthy and returnable on close.
            if e.is_bad_connection() {
                self.poison(e)
            } else {
                e
            }
        })
    }

    /// Sets the poisoned flag and wraps `cause` so the original error
    /// reaches the caller, per the contract that poisoning must never
    /// suppress the underlying failure.
    fn poison(&self, cause: ReservoirError) -> ReservoirError {
        self.poisoned.store(true, Ordering::Release);
        ReservoirError::Poisoned(Box::new(cause))
    }

    /// Idempotent. The first call routes the wrapped connection to
    /// `Reservoir::discard` (if poisoned) or `Reservoir::return_conn`
    /// (otherwise); every later call is a no-op.
    pub async fn close(&self, now: Instant) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut guard = self.pc.lock().await;
        let pc = match guard.take() {
            Some(pc) => pc,
            None => return,
        };
        drop(guard);

        if self.poisoned.load(Ordering::Acquire) {
            self.reservoir
                .discard(pc, crate::error::DiscardReason::Poisoned);
        } else {
            self.reservoir.return_conn(pc, now).await;
        }
    }
}

fn not_supported(op: &'static str) -> ReservoirError {
    ReservoirError::Fatal(format!("connection does not advertise capability: {op}"))
}
