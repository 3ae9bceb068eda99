/*!
 * Configuration structures and defaults for the connection reservoir
 */

use crate::error::{ReservoirError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level reservoir configuration. Field names map 1:1 onto the options
/// table in the design: `target_ready`, `low_watermark`, `base_lifetime`,
/// `lifetime_jitter`, `guard_window`, `initial_fill_timeout`,
/// `blocking_checkout_wait`, plus the nested lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservoirConfig {
    /// Turns the reservoir on. Off means the driver façade is bypassed and
    /// the host pool is expected to dial directly.
    pub enabled: bool,

    /// Ready-buffer capacity and refill target.
    pub target_ready: usize,

    /// Depth below which the refiller switches to aggressive warmup pacing.
    pub low_watermark: usize,

    /// Base connection lifetime before jitter.
    #[serde(with = "duration_secs")]
    pub base_lifetime: Duration,

    /// Upper bound on uniformly sampled additional lifetime.
    #[serde(with = "duration_secs")]
    pub lifetime_jitter: Duration,

    /// Remaining-lifetime threshold below which a connection is unsafe to
    /// hand out or return.
    #[serde(with = "duration_secs")]
    pub guard_window: Duration,

    /// Upper bound on the synchronous initial-fill wait at startup.
    #[serde(with = "duration_secs")]
    pub initial_fill_timeout: Duration,

    /// Upper bound on `Reservoir::blocking_checkout`'s wait.
    #[serde(with = "duration_millis")]
    pub blocking_checkout_wait: Duration,

    /// How often the expiry scanner walks the buffer.
    #[serde(with = "duration_millis")]
    pub scan_interval: Duration,

    /// Aggressive-warmup batch size used while depth < low_watermark.
    pub aggressive_batch: usize,

    /// Distributed lease manager configuration.
    pub lease: LeaseConfig,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_ready: 20,
            low_watermark: 5,
            base_lifetime: Duration::from_secs(11 * 60),
            lifetime_jitter: Duration::from_secs(2 * 60),
            guard_window: Duration::from_secs(45),
            initial_fill_timeout: Duration::from_secs(5),
            blocking_checkout_wait: Duration::from_millis(100),
            scan_interval: Duration::from_secs(1),
            aggressive_batch: 4,
            lease: LeaseConfig::default(),
        }
    }
}

impl ReservoirConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReservoirError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ReservoirError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ReservoirError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would violate the component invariants
    /// before a `Reservoir` is ever constructed from them.
    pub fn validate(&self) -> Result<()> {
        if self.target_ready == 0 {
            return Err(ReservoirError::Config(
                "target_ready must be greater than zero".into(),
            ));
        }
        if self.low_watermark > self.target_ready {
            return Err(ReservoirError::Config(
                "low_watermark must be no larger than target_ready".into(),
            ));
        }
        if self.base_lifetime.is_zero() {
            return Err(ReservoirError::Config(
                "base_lifetime must be greater than zero".into(),
            ));
        }
        if self.guard_window >= self.base_lifetime {
            return Err(ReservoirError::Config(
                "guard_window must be smaller than base_lifetime".into(),
            ));
        }
        if self.aggressive_batch == 0 {
            return Err(ReservoirError::Config(
                "aggressive_batch must be greater than zero".into(),
            ));
        }
        self.lease.validate()?;
        Ok(())
    }
}

/// Configuration for the distributed lease manager (component 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Enables the distributed lease manager. Off means `Acquire` returns
    /// synthetic local-only lease IDs.
    pub lease_enabled: bool,

    /// KV table identifying the lease store.
    pub lease_table: String,

    /// Endpoint namespace within the table (the `<endpoint>` in
    /// `counter#<endpoint>` / `lease#<endpoint>#<leaseID>`).
    pub lease_endpoint_key: String,

    /// Cluster-wide upper bound admitted by `Acquire`.
    pub lease_limit: u32,

    /// Per-lease item TTL — the crash-recovery horizon.
    #[serde(with = "duration_secs")]
    pub lease_ttl: Duration,

    /// When the distributed store is unavailable: `true` degrades to
    /// synthetic local-only admission with a warning; `false` is strict
    /// (refiller stalls, `TransientUnavailable` surfaces to the caller).
    pub degraded_mode: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_enabled: false,
            lease_table: "connection-leases".to_string(),
            lease_endpoint_key: "default".to_string(),
            lease_limit: 100,
            lease_ttl: Duration::from_secs(30),
            degraded_mode: true,
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_enabled && self.lease_limit == 0 {
            return Err(ReservoirError::Config(
                "lease_limit must be greater than zero when leasing is enabled".into(),
            ));
        }
        if self.lease_ttl.is_zero() {
            return Err(ReservoirError::Config(
                "lease_ttl must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ReservoirConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_watermark_above_target() {
        let config = ReservoirConfig {
            target_ready: 5,
            low_watermark: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_guard_window_not_smaller_than_lifetime() {
        let config = ReservoirConfig {
            base_lifetime: Duration::from_secs(30),
            guard_window: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ReservoirConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed = ReservoirConfig::from_toml_str(&serialized).unwrap();
        assert_eq!(parsed.target_ready, config.target_ready);
        assert_eq!(parsed.lease.lease_limit, config.lease.lease_limit);
    }

    #[test]
    fn rejects_zero_lease_limit_when_enabled() {
        let config = ReservoirConfig {
            lease: LeaseConfig {
                lease_enabled: true,
                lease_limit: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
