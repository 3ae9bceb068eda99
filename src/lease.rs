/*!
 * Distributed connection-count lease manager
 *
 * Bounds cluster-wide open connections through a conditional transactional
 * write over a key-value store, with TTL-based reclamation of leases whose
 * owner crashed before releasing. The manager is deliberately thin: all
 * atomicity lives in the store; the manager only sequences retries, backoff,
 * and the degraded-mode fallback.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::LeaseConfig;
use crate::error::{ReservoirError, Result};

const MAX_ACQUIRE_RETRIES: u32 = 5;
const MAX_RELEASE_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(2);

/// Outcomes a [`LeaseStore`] backend can report. `LimitReached` is an
/// expected, non-retryable admission-control outcome; `Unavailable` is a
/// transient store-level failure the manager retries and may degrade past.
#[derive(Debug)]
pub enum LeaseStoreError {
    LimitReached,
    Unavailable(String),
}

/// The conditional transactional key-value store the lease manager sits on
/// top of. A real backend (e.g. DynamoDB's `TransactWriteItems` plus a
/// native TTL attribute) implements this; [`InMemoryLeaseStore`] is a
/// single-process stand-in used by default and by tests.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Conditionally increments the counter for `endpoint` and puts a
    /// per-lease item with `ttl` if and only if the counter was below
    /// `limit`, as one atomic transaction. Returns the new lease id.
    async fn acquire(
        &self,
        endpoint: &str,
        limit: u32,
        ttl: Duration,
    ) -> std::result::Result<String, LeaseStoreError>;

    /// Deletes the per-lease item and decrements the counter, as one atomic
    /// transaction. Idempotent: releasing an already-expired or unknown
    /// lease id succeeds silently, since TTL reclamation may have already
    /// removed it.
    async fn release(
        &self,
        endpoint: &str,
        lease_id: &str,
    ) -> std::result::Result<(), LeaseStoreError>;
}

/// Sequences acquire/release against a [`LeaseStore`], applying retry,
/// backoff, and the configured degraded-mode policy. Owns no connection
/// state itself — the reservoir and refiller hold the actual leases by id.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    /// Acquires one lease, or fails. Never blocks past `cancel` firing.
    ///
    /// When leasing is disabled outright, returns a synthetic local-only id
    /// immediately. When the store reports the limit is reached, returns
    /// [`ReservoirError::LimitReached`] without retrying — that outcome is
    /// routine admission control, not a store failure, and the refiller is
    /// responsible for backing off before its next attempt. When the store
    /// is transiently unavailable, retries with bounded exponential backoff
    /// before either degrading to a synthetic lease or surfacing
    /// [`ReservoirError::LeaseStoreUnavailable`], depending on configuration.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<String> {
        if !self.config.lease_enabled {
            return Ok(synthetic_lease_id());
        }

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ReservoirError::Cancelled);
            }

            match self
                .store
                .acquire(&self.config.lease_endpoint_key, self.config.lease_limit, self.config.lease_ttl)
                .await
            {
                Ok(lease_id) => {
                    record_acquire(true);
                    return Ok(lease_id);
                }
                Err(LeaseStoreError::LimitReached) => {
                    record_acquire(false);
                    return Err(ReservoirError::LimitReached);
                }
                Err(LeaseStoreError::Unavailable(reason)) => {
                    attempt += 1;
                    if attempt > MAX_ACQUIRE_RETRIES {
                        record_acquire(false);
                        if self.config.degraded_mode {
                            warn!(
                                endpoint = %self.config.lease_endpoint_key,
                                %reason,
                                "lease store unavailable after retries; degrading to synthetic local-only lease"
                            );
                            return Ok(synthetic_lease_id());
                        }
                        return Err(ReservoirError::LeaseStoreUnavailable);
                    }

                    let delay = backoff_for(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => return Err(ReservoirError::Cancelled),
                    }
                }
            }
        }
    }

    /// Releases a previously acquired lease. Fire-and-forget friendly: a
    /// synthetic (locally degraded) lease id is recognized and skipped
    /// without contacting the store. Real leases are retried a bounded
    /// number of times; a release that still fails is logged and left to
    /// TTL reclamation rather than propagated to the caller, matching the
    /// reservoir's "never block a caller on lease release" contract.
    pub async fn release(&self, lease_id: &str) {
        if !self.config.lease_enabled || is_synthetic(lease_id) {
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            match self
                .store
                .release(&self.config.lease_endpoint_key, lease_id)
                .await
            {
                Ok(()) => {
                    record_release(true);
                    return;
                }
                Err(LeaseStoreError::LimitReached) => {
                    // Not a meaningful outcome for release; treat as success
                    // of the delete-side effect and stop retrying.
                    record_release(true);
                    return;
                }
                Err(LeaseStoreError::Unavailable(reason)) => {
                    attempt += 1;
                    if attempt > MAX_RELEASE_RETRIES {
                        record_release(false);
                        warn!(
                            lease_id,
                            %reason,
                            "lease release failed after retries; relying on TTL reclamation"
                        );
                        return;
                    }
                    tokio::time::sleep(backoff_for(attempt)).await;
                }
            }
        }
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(1u32 << attempt.min(6));
    let capped = exp.min(RETRY_MAX);
    let jitter_millis = rand::rng().random_range(0..=capped.as_millis() as u64 / 4 + 1);
    capped + Duration::from_millis(jitter_millis)
}

fn synthetic_lease_id() -> String {
    let suffix: u64 = rand::rng().random();
    format!("local-{suffix:016x}")
}

fn is_synthetic(lease_id: &str) -> bool {
    lease_id.starts_with("local-")
}

#[cfg(feature = "metrics")]
fn record_acquire(ok: bool) {
    let label = if ok { "ok" } else { "denied" };
    crate::metrics::metrics()
        .lease_acquires_total
        .with_label_values(&[label])
        .inc();
}

#[cfg(not(feature = "metrics"))]
fn record_acquire(_ok: bool) {}

#[cfg(feature = "metrics")]
fn record_release(ok: bool) {
    let label = if ok { "ok" } else { "failed" };
    crate::metrics::metrics()
        .lease_releases_total
        .with_label_values(&[label])
        .inc();
}

#[cfg(not(feature = "metrics"))]
fn record_release(_ok: bool) {}

/// A single-process lease store: a counter plus a map of live lease ids to
/// their TTL deadlines, both guarded by one mutex. Stands in for a real
/// distributed KV store in tests and in deployments with only one process
/// per endpoint. TTL reclamation is simulated by sweeping expired entries
/// on every `acquire`/`release` call rather than a background sweeper,
/// since nothing else in this store ever needs to observe expiry in
/// between calls.
pub struct InMemoryLeaseStore {
    state: Mutex<InMemoryState>,
}

struct InMemoryState {
    active: u32,
    leases: HashMap<String, Instant>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState {
                active: 0,
                leases: HashMap::new(),
            }),
        }
    }

    fn sweep_expired(state: &mut InMemoryState, now: Instant) {
        let before = state.leases.len();
        state.leases.retain(|_, deadline| *deadline > now);
        let reclaimed = before - state.leases.len();
        state.active = state.active.saturating_sub(reclaimed as u32);
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(
        &self,
        _endpoint: &str,
        limit: u32,
        ttl: Duration,
    ) -> std::result::Result<String, LeaseStoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Self::sweep_expired(&mut state, now);

        if state.active >= limit {
            return Err(LeaseStoreError::LimitReached);
        }

        let lease_id = format!("lease-{:016x}", rand::rng().random::<u64>());
        state.active += 1;
        state.leases.insert(lease_id.clone(), now + ttl);
        Ok(lease_id)
    }

    async fn release(
        &self,
        _endpoint: &str,
        lease_id: &str,
    ) -> std::result::Result<(), LeaseStoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Self::sweep_expired(&mut state, now);

        if state.leases.remove(lease_id).is_some() {
            state.active = state.active.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(feature = "dynamodb-lease")]
pub mod dynamodb_impl {
    //! Production lease store backed by DynamoDB `TransactWriteItems` plus a
    //! native TTL attribute, mirroring the item schema from the design: a
    //! `counter#<endpoint>` item with an `active` count, and one
    //! `lease#<endpoint>#<leaseID>` item per outstanding lease.

    use super::*;
    use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem, Update};
    use aws_sdk_dynamodb::Client;

    pub struct DynamoDbLeaseStore {
        client: Client,
        table: String,
    }

    impl DynamoDbLeaseStore {
        pub fn new(client: Client, table: impl Into<String>) -> Self {
            Self {
                client,
                table: table.into(),
            }
        }

        fn counter_key(endpoint: &str) -> String {
            format!("counter#{endpoint}")
        }

        fn lease_key(endpoint: &str, lease_id: &str) -> String {
            format!("lease#{endpoint}#{lease_id}")
        }
    }

    #[async_trait]
    impl LeaseStore for DynamoDbLeaseStore {
        async fn acquire(
            &self,
            endpoint: &str,
            limit: u32,
            ttl: Duration,
        ) -> std::result::Result<String, LeaseStoreError> {
            let lease_id = format!("{:016x}", rand::rng().random::<u64>());
            let now_ms = now_millis();
            let ttl_epoch = (std::time::SystemTime::now() + ttl)
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;

            let counter_update = Update::builder()
                .table_name(&self.table)
                .key("pk", AttributeValue::S(Self::counter_key(endpoint)))
                .update_expression("SET active = if_not_exists(active, :zero) + :one, updatedMs = :now")
                .condition_expression("attribute_not_exists(active) OR active < :limit")
                .expression_attribute_values(":one", AttributeValue::N("1".into()))
                .expression_attribute_values(":zero", AttributeValue::N("0".into()))
                .expression_attribute_values(":limit", AttributeValue::N(limit.to_string()))
                .expression_attribute_values(":now", AttributeValue::N(now_ms.to_string()))
                .build()
                .map_err(|e| LeaseStoreError::Unavailable(e.to_string()))?;

            let lease_put = Put::builder()
                .table_name(&self.table)
                .item("pk", AttributeValue::S(Self::lease_key(endpoint, &lease_id)))
                .item("ttlEpoch", AttributeValue::N(ttl_epoch.to_string()))
                .item("ownerID", AttributeValue::S(lease_id.clone()))
                .item("createdMs", AttributeValue::N(now_ms.to_string()))
                .build()
                .map_err(|e| LeaseStoreError::Unavailable(e.to_string()))?;

            let result = self
                .client
                .transact_write_items()
                .transact_items(TransactWriteItem::builder().update(counter_update).build())
                .transact_items(TransactWriteItem::builder().put(lease_put).build())
                .send()
                .await;

            match result {
                Ok(_) => Ok(lease_id),
                Err(err) => {
                    if is_conditional_check_failure(&err) {
                        Err(LeaseStoreError::LimitReached)
                    } else {
                        Err(LeaseStoreError::Unavailable(err.to_string()))
                    }
                }
            }
        }

        async fn release(
            &self,
            endpoint: &str,
            lease_id: &str,
        ) -> std::result::Result<(), LeaseStoreError> {
            let counter_update = Update::builder()
                .table_name(&self.table)
                .key("pk", AttributeValue::S(Self::counter_key(endpoint)))
                .update_expression("SET active = active - :one")
                .condition_expression("active > :zero")
                .expression_attribute_values(":one", AttributeValue::N("1".into()))
                .expression_attribute_values(":zero", AttributeValue::N("0".into()))
                .build()
                .map_err(|e| LeaseStoreError::Unavailable(e.to_string()))?;

            let result = self
                .client
                .transact_write_items()
                .transact_items(
                    TransactWriteItem::builder()
                        .delete(
                            aws_sdk_dynamodb::types::Delete::builder()
                                .table_name(&self.table)
                                .key("pk", AttributeValue::S(Self::lease_key(endpoint, lease_id)))
                                .build()
                                .map_err(|e| LeaseStoreError::Unavailable(e.to_string()))?,
                        )
                        .build(),
                )
                .transact_items(TransactWriteItem::builder().update(counter_update).build())
                .send()
                .await;

            match result {
                Ok(_) => Ok(()),
                // A failed decrement with a successful delete is exactly the
                // drift the design accepts — TTL reclamation is the
                // fallback, so this still reports success to the caller.
                Err(err) if is_conditional_check_failure(&err) => Ok(()),
                Err(err) => Err(LeaseStoreError::Unavailable(err.to_string())),
            }
        }
    }

    fn now_millis() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn is_conditional_check_failure<E: std::fmt::Display>(err: &E) -> bool {
        err.to_string().contains("ConditionalCheckFailed")
            || err.to_string().contains("TransactionCanceledException")
    }
}
