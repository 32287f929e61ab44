//! Bot identity configuration and runtime control state

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Per-identity configuration
///
/// Rate and retry limits are required: they differ per account, so there is
/// no global default to fall back on. Per-target limits are off unless set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(rename = "identity-id")]
    pub identity_id: String,

    /// Token bucket size
    #[serde(rename = "rate-limit-capacity")]
    pub rate_limit_capacity: u32,

    /// Time for a spent token to return to the bucket
    #[serde(rename = "refill-interval-ms")]
    pub refill_interval_ms: u64,

    /// Transient failures tolerated before a message is marked failed
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// First retry delay, doubled on each further attempt
    #[serde(rename = "backoff-base-ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on a retry delay before jitter
    #[serde(rename = "backoff-cap-ms")]
    pub backoff_cap_ms: u64,

    /// Minimum gap between two sends to the same target (0 = off)
    #[serde(rename = "target-cooldown-ms", default)]
    pub target_cooldown_ms: u64,

    /// Sends to one target allowed in any hour (0 = unlimited)
    #[serde(rename = "max-per-target-per-hour", default)]
    pub max_per_target_per_hour: u32,
}

impl IdentityConfig {
    pub fn new(
        identity_id: impl Into<String>,
        rate_limit_capacity: u32,
        refill_interval_ms: u64,
        max_attempts: u32,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            rate_limit_capacity,
            refill_interval_ms,
            max_attempts,
            backoff_base_ms,
            backoff_cap_ms,
            target_cooldown_ms: 0,
            max_per_target_per_hour: 0,
        }
    }

    /// Spam protection for individual chats
    pub fn with_target_limits(mut self, cooldown_ms: u64, max_per_hour: u32) -> Self {
        self.target_cooldown_ms = cooldown_ms;
        self.max_per_target_per_hour = max_per_hour;
        self
    }

    pub fn has_target_limits(&self) -> bool {
        self.target_cooldown_ms > 0 || self.max_per_target_per_hour > 0
    }

    /// Reject configurations the limiter or retry policy can't honor
    pub fn validate(&self) -> Result<(), DispatchError> {
        let fail = |what: &str| {
            Err(DispatchError::InvalidConfig(format!(
                "identity '{}': {}",
                self.identity_id, what
            )))
        };

        if self.identity_id.trim().is_empty() {
            return Err(DispatchError::InvalidConfig("identity-id must not be empty".to_string()));
        }
        if self.rate_limit_capacity == 0 {
            return fail("rate-limit-capacity must be at least 1");
        }
        if self.refill_interval_ms == 0 {
            return fail("refill-interval-ms must be positive");
        }
        if self.max_attempts == 0 {
            return fail("max-attempts must be at least 1");
        }
        if self.backoff_base_ms == 0 {
            return fail("backoff-base-ms must be positive");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return fail("backoff-cap-ms must not be below backoff-base-ms");
        }
        Ok(())
    }
}

/// Persisted runtime state of an identity, shared across processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityState {
    pub identity_id: String,

    /// Operator paused dispatch
    #[serde(default)]
    pub paused: bool,

    /// Transport session connected
    #[serde(default)]
    pub online: bool,

    /// Last surfaced error (permanent failures, connect failures)
    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub last_error_at: Option<i64>,

    /// Messages delivered by this identity
    #[serde(default)]
    pub sent_count: u64,
}

impl IdentityState {
    pub fn new(identity_id: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            ..Default::default()
        }
    }

    pub fn set_error(&mut self, error: impl Into<String>, now: i64) {
        self.last_error = Some(error.into());
        self.last_error_at = Some(now);
    }
}
