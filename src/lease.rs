//! Lease manager
//!
//! One valid lease per identity, stored at `lease:{identity}` and changed only
//! through conditional writes. Acquisition succeeds when the lease is absent,
//! expired, or already held by the caller (renewal).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::Lease;
use crate::error::{DispatchError, DispatchResult};
use crate::store::{self, CasOutcome, StateStore, keys};

const MAX_CAS_RETRIES: usize = 16;

/// Result of [`LeaseManager::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    Renewed(Lease),
    /// Another holder owns a valid lease
    Held { holder: String, expires_at: i64 },
}

impl LeaseOutcome {
    pub fn is_owned(&self) -> bool {
        !matches!(self, LeaseOutcome::Held { .. })
    }

    /// Expiry of the caller's lease, if it owns one
    pub fn expires_at(&self) -> Option<i64> {
        match self {
            LeaseOutcome::Acquired(lease) | LeaseOutcome::Renewed(lease) => Some(lease.expires_at),
            LeaseOutcome::Held { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn StateStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Acquire or renew the identity's lease for `ttl`
    pub async fn acquire(&self, identity_id: &str, holder: &str, now: i64, ttl: Duration) -> DispatchResult<LeaseOutcome> {
        debug!(%identity_id, %holder, now, "acquire: called");
        let key = keys::lease(identity_id);
        let next = Lease {
            identity_id: identity_id.to_string(),
            holder_token: holder.to_string(),
            expires_at: now + ttl.as_millis() as i64,
        };

        for _ in 0..MAX_CAS_RETRIES {
            let current = store::load::<Lease>(self.store.as_ref(), &key).await?;

            let (expected, renewing) = match &current {
                Some((lease, _)) if lease.is_valid(now) && lease.holder_token != holder => {
                    return Ok(LeaseOutcome::Held {
                        holder: lease.holder_token.clone(),
                        expires_at: lease.expires_at,
                    });
                }
                Some((lease, version)) => (Some(*version), lease.is_held_by(holder, now)),
                None => (None, false),
            };

            match store::save(self.store.as_ref(), &key, expected, &next).await? {
                CasOutcome::Written { .. } if renewing => return Ok(LeaseOutcome::Renewed(next)),
                CasOutcome::Written { .. } => {
                    info!(%identity_id, %holder, expires_at = next.expires_at, "Lease acquired");
                    return Ok(LeaseOutcome::Acquired(next));
                }
                CasOutcome::Conflict { .. } => {
                    debug!(%identity_id, "acquire: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!("too much contention on lease of {}", identity_id)))
    }

    /// Whether `holder` still owns a valid lease
    pub async fn verify(&self, identity_id: &str, holder: &str, now: i64) -> DispatchResult<bool> {
        let current = store::load::<Lease>(self.store.as_ref(), &keys::lease(identity_id)).await?;
        Ok(current.is_some_and(|(lease, _)| lease.is_held_by(holder, now)))
    }

    /// Give up the lease if `holder` owns the record
    pub async fn release(&self, identity_id: &str, holder: &str) -> DispatchResult<bool> {
        debug!(%identity_id, %holder, "release: called");
        let key = keys::lease(identity_id);

        for _ in 0..MAX_CAS_RETRIES {
            let Some((lease, version)) = store::load::<Lease>(self.store.as_ref(), &key).await? else {
                return Ok(false);
            };
            if lease.holder_token != holder {
                return Ok(false);
            }
            match self.store.cas_write(&key, Some(version), None).await? {
                CasOutcome::Written { .. } => {
                    info!(%identity_id, %holder, "Lease released");
                    return Ok(true);
                }
                CasOutcome::Conflict { .. } => {
                    debug!(%identity_id, "release: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!("too much contention on lease of {}", identity_id)))
    }

    /// Current valid lease, if any
    pub async fn holder(&self, identity_id: &str, now: i64) -> DispatchResult<Option<Lease>> {
        let current = store::load::<Lease>(self.store.as_ref(), &keys::lease(identity_id)).await?;
        Ok(current.map(|(lease, _)| lease).filter(|lease| lease.is_valid(now)))
    }
}
