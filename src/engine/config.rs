//! Scheduler engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::DispatchError;
use crate::worker::WorkerConfig;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the lease/supervision tick
    #[serde(rename = "tick-interval-ms", default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Lease lifetime; at least two ticks so renewal happens by half-life
    #[serde(rename = "lease-ttl-ms", default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Idle worker re-check period
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Worker wait after the rate limiter denied a token
    #[serde(rename = "rate-limit-backoff-ms", default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,

    /// First delay after a store failure
    #[serde(rename = "store-retry-base-ms", default = "default_store_retry_base_ms")]
    pub store_retry_base_ms: u64,

    /// Longest delay between store retries
    #[serde(rename = "store-retry-cap-ms", default = "default_store_retry_cap_ms")]
    pub store_retry_cap_ms: u64,

    /// Transient connect failures tolerated per worker start
    #[serde(rename = "max-connect-attempts", default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Wait before re-leasing an identity whose transport failed to connect
    #[serde(rename = "connect-cooldown-ms", default = "default_connect_cooldown_ms")]
    pub connect_cooldown_ms: u64,

    /// Time workers get to finish their current step on shutdown
    #[serde(rename = "shutdown-timeout-ms", default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Terminal messages older than this are purged
    #[serde(rename = "retention-ms", default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Run the retention purge every N ticks
    #[serde(rename = "cleanup-every-ticks", default = "default_cleanup_every_ticks")]
    pub cleanup_every_ticks: u64,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_rate_limit_backoff_ms() -> u64 {
    250
}

fn default_store_retry_base_ms() -> u64 {
    100
}

fn default_store_retry_cap_ms() -> u64 {
    5_000
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_connect_cooldown_ms() -> u64 {
    60_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_retention_ms() -> u64 {
    7 * 24 * 60 * 60 * 1_000
}

fn default_cleanup_every_ticks() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        debug!("EngineConfig::default: called");
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            store_retry_base_ms: default_store_retry_base_ms(),
            store_retry_cap_ms: default_store_retry_cap_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            connect_cooldown_ms: default_connect_cooldown_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            retention_ms: default_retention_ms(),
            cleanup_every_ticks: default_cleanup_every_ticks(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Settings handed to each spawned worker
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            rate_limit_backoff: Duration::from_millis(self.rate_limit_backoff_ms),
            store_retry_base_ms: self.store_retry_base_ms,
            store_retry_cap_ms: self.store_retry_cap_ms,
            max_connect_attempts: self.max_connect_attempts,
        }
    }

    /// Reject settings that break lease renewal or spin
    pub fn validate(&self) -> Result<(), DispatchError> {
        let fail = |what: &str| Err(DispatchError::InvalidConfig(format!("engine: {}", what)));

        let positive = [
            ("tick-interval-ms", self.tick_interval_ms),
            ("lease-ttl-ms", self.lease_ttl_ms),
            ("poll-interval-ms", self.poll_interval_ms),
            ("rate-limit-backoff-ms", self.rate_limit_backoff_ms),
            ("store-retry-base-ms", self.store_retry_base_ms),
            ("cleanup-every-ticks", self.cleanup_every_ticks),
        ];
        for (name, value) in positive {
            if value == 0 {
                return fail(&format!("{} must be positive", name));
            }
        }
        if self.max_connect_attempts == 0 {
            return fail("max-connect-attempts must be at least 1");
        }
        if self.tick_interval_ms.saturating_mul(2) > self.lease_ttl_ms {
            return fail("lease-ttl-ms must be at least twice tick-interval-ms");
        }
        if self.store_retry_cap_ms < self.store_retry_base_ms {
            return fail("store-retry-cap-ms must not be below store-retry-base-ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval_ms, 1_000);
        assert_eq!(config.lease_ttl_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lease_must_cover_two_ticks() {
        let config = EngineConfig {
            tick_interval_ms: 6_000,
            lease_ttl_ms: 10_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DispatchError::InvalidConfig(_))));

        let config = EngineConfig {
            tick_interval_ms: 5_000,
            lease_ttl_ms: 10_000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = EngineConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            cleanup_every_ticks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "tick-interval-ms: 200\nlease-ttl-ms: 1000\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tick_interval_ms, 200);
        assert_eq!(config.lease_ttl_ms, 1_000);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.lease_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_worker_config() {
        let config = EngineConfig {
            poll_interval_ms: 50,
            rate_limit_backoff_ms: 20,
            ..Default::default()
        };
        let worker = config.worker_config();
        assert_eq!(worker.poll_interval, Duration::from_millis(50));
        assert_eq!(worker.rate_limit_backoff, Duration::from_millis(20));
    }
}
