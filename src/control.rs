//! Per-identity control state
//!
//! `identity:{id}` holds the operator and runtime flags shared by every
//! process: paused, online, last error, sent counter.

use std::sync::Arc;

use tracing::debug;

use crate::domain::IdentityState;
use crate::error::{DispatchError, DispatchResult};
use crate::store::{self, CasOutcome, StateStore, keys};

const MAX_CAS_RETRIES: usize = 32;

#[derive(Clone)]
pub struct IdentityControl {
    store: Arc<dyn StateStore>,
}

impl IdentityControl {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Current state; an identity never written is active and offline
    pub async fn get(&self, identity_id: &str) -> DispatchResult<IdentityState> {
        let loaded = store::load::<IdentityState>(self.store.as_ref(), &keys::identity(identity_id)).await?;
        Ok(loaded
            .map(|(state, _)| state)
            .unwrap_or_else(|| IdentityState::new(identity_id)))
    }

    /// Read-modify-CAS loop over the identity's state
    pub async fn update<F>(&self, identity_id: &str, mut apply: F) -> DispatchResult<IdentityState>
    where
        F: FnMut(&mut IdentityState) + Send,
    {
        let key = keys::identity(identity_id);

        for _ in 0..MAX_CAS_RETRIES {
            let (mut state, version) = match store::load::<IdentityState>(self.store.as_ref(), &key).await? {
                Some((state, version)) => (state, Some(version)),
                None => (IdentityState::new(identity_id), None),
            };
            apply(&mut state);

            match store::save(self.store.as_ref(), &key, version, &state).await? {
                CasOutcome::Written { .. } => return Ok(state),
                CasOutcome::Conflict { .. } => {
                    debug!(%identity_id, "update: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!("too much contention on identity {}", identity_id)))
    }

    pub async fn set_paused(&self, identity_id: &str, paused: bool) -> DispatchResult<IdentityState> {
        debug!(%identity_id, paused, "set_paused: called");
        self.update(identity_id, |s| s.paused = paused).await
    }

    pub async fn set_online(&self, identity_id: &str, online: bool) -> DispatchResult<IdentityState> {
        debug!(%identity_id, online, "set_online: called");
        self.update(identity_id, |s| s.online = online).await
    }

    pub async fn record_error(&self, identity_id: &str, error: &str, now: i64) -> DispatchResult<IdentityState> {
        debug!(%identity_id, %error, "record_error: called");
        self.update(identity_id, |s| s.set_error(error, now)).await
    }

    pub async fn record_sent(&self, identity_id: &str) -> DispatchResult<IdentityState> {
        self.update(identity_id, |s| s.sent_count += 1).await
    }
}
