/*!
 * The underlying connection and dial-function abstractions
 *
 * The reservoir never assumes a fixed vtable for the physical connection:
 * per the design notes, the handle wrapper probes whichever capabilities a
 * given connection advertises and forwards only those. `Capabilities` is the
 * probe result; `Connection` is the trait a concrete driver implements.
 */

use async_trait::async_trait;
use bitflags::bitflags;

use crate::credential::Credential;
use crate::error::Result;

bitflags! {
    /// The capability set a physical connection may advertise. Mirrors the
    /// six operations named in the data model: execute, prepare,
    /// begin-transaction, ping, reset-session, validate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const EXECUTE           = 0b0000_0001;
        const PREPARE           = 0b0000_0010;
        const BEGIN_TRANSACTION = 0b0000_0100;
        const PING              = 0b0000_1000;
        const RESET_SESSION     = 0b0001_0000;
        const VALIDATE          = 0b0010_0000;
    }
}

/// A live physical database connection. Concrete drivers implement this;
/// the reservoir and handle only ever interact with it through this trait
/// plus the capability bitset returned by `capabilities()`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Which of the six forwarded operations this connection supports.
    /// Queried once, at handle-wrap time — the contract assumes this does
    /// not change over the connection's lifetime.
    fn capabilities(&self) -> Capabilities;

    async fn execute(&self, _query: &str) -> Result<()> {
        unsupported("execute")
    }

    async fn prepare(&self, _query: &str) -> Result<()> {
        unsupported("prepare")
    }

    async fn begin_transaction(&self) -> Result<()> {
        unsupported("begin_transaction")
    }

    async fn ping(&self) -> Result<()> {
        unsupported("ping")
    }

    async fn reset_session(&self) -> Result<()> {
        unsupported("reset_session")
    }

    /// Health-check used opportunistically; a `false` result is a
    /// bad-connection signal equivalent to an error, per the design's
    /// poisoning contract.
    async fn validate(&self) -> Result<bool> {
        unsupported("validate")
    }
}

fn unsupported<T>(op: &'static str) -> Result<T> {
    Err(crate::error::ReservoirError::Fatal(format!(
        "connection does not advertise capability: {op}"
    )))
}

/// Dials a fresh physical connection using a DSN and a freshly fetched
/// credential. Called only from the refiller's `open_one` chain.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Connection + 'static;

    async fn dial(&self, dsn: &str, credential: &Credential) -> Result<Self::Conn>;
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn unadvertised_capability_returns_fatal() {
        let conn = FakeConnection::new();
        assert!(!conn.capabilities().contains(Capabilities::PREPARE));
        let result = conn.prepare("select 1").await;
        assert!(matches!(result, Err(crate::error::ReservoirError::Fatal(_))));
    }

    #[tokio::test]
    async fn advertised_capability_forwards() {
        let conn = FakeConnection::new();
        assert!(conn.capabilities().contains(Capabilities::PING));
        conn.ping().await.unwrap();
    }
}
