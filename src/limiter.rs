//! Per-identity rate limiter
//!
//! A token bucket persisted at `bucket:{identity}`. Each consumed token comes
//! back `refill-interval-ms` after it was spent, so no window of that length
//! ever sees more than `capacity` sends, regardless of which process sent
//! them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::{IdentityConfig, RateLimitBucket};
use crate::error::{DispatchError, DispatchResult};
use crate::store::{self, CasOutcome, StateStore, keys};

const MAX_CAS_RETRIES: usize = 64;

/// Store-backed token buckets
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    async fn load(&self, identity: &IdentityConfig, now: i64) -> DispatchResult<(RateLimitBucket, Option<u64>)> {
        let key = keys::bucket(&identity.identity_id);
        let (mut bucket, version) = match store::load::<RateLimitBucket>(self.store.as_ref(), &key).await? {
            Some((bucket, version)) => (bucket, Some(version)),
            None => (
                RateLimitBucket::full(&identity.identity_id, identity.rate_limit_capacity, now),
                None,
            ),
        };
        bucket.refill(
            identity.rate_limit_capacity,
            identity.refill_interval_ms as i64,
            now,
        );
        Ok((bucket, version))
    }

    /// Take one token if available; `false` means do not send
    pub async fn try_consume(&self, identity: &IdentityConfig, now: i64) -> DispatchResult<bool> {
        debug!(identity_id = %identity.identity_id, now, "try_consume: called");
        let key = keys::bucket(&identity.identity_id);

        for _ in 0..MAX_CAS_RETRIES {
            let (mut bucket, version) = self.load(identity, now).await?;
            if bucket.tokens_remaining == 0 {
                debug!(
                    identity_id = %identity.identity_id,
                    provider_cooldown = bucket.is_blocked(now),
                    "try_consume: denied"
                );
                return Ok(false);
            }

            bucket.spent.push(now);
            bucket.tokens_remaining -= 1;

            match store::save(self.store.as_ref(), &key, version, &bucket).await? {
                CasOutcome::Written { .. } => return Ok(true),
                CasOutcome::Conflict { .. } => {
                    debug!(identity_id = %identity.identity_id, "try_consume: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!(
            "too much contention on bucket of {}",
            identity.identity_id
        )))
    }

    /// Empty the bucket and refuse tokens for `cooldown` (provider flood
    /// control)
    pub async fn force_drain(&self, identity: &IdentityConfig, now: i64, cooldown: Duration) -> DispatchResult<()> {
        debug!(identity_id = %identity.identity_id, ?cooldown, "force_drain: called");
        let key = keys::bucket(&identity.identity_id);
        let until = now + cooldown.as_millis() as i64;

        for _ in 0..MAX_CAS_RETRIES {
            let (mut bucket, version) = self.load(identity, now).await?;
            bucket.blocked_until = Some(bucket.blocked_until.map_or(until, |prev| prev.max(until)));
            bucket.tokens_remaining = 0;

            match store::save(self.store.as_ref(), &key, version, &bucket).await? {
                CasOutcome::Written { .. } => {
                    info!(identity_id = %identity.identity_id, blocked_until = until, "Rate limiter drained");
                    return Ok(());
                }
                CasOutcome::Conflict { .. } => {
                    debug!(identity_id = %identity.identity_id, "force_drain: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!(
            "too much contention on bucket of {}",
            identity.identity_id
        )))
    }

    /// Current bucket as of `now`, without consuming
    pub async fn snapshot(&self, identity: &IdentityConfig, now: i64) -> DispatchResult<RateLimitBucket> {
        Ok(self.load(identity, now).await?.0)
    }
}
