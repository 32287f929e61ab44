//! Per-target spam protection
//!
//! Sends from one identity to one chat are tracked at
//! `target:{identity}:{target}`. A target is blocked for
//! `target-cooldown-ms` after each send, and once it has received
//! `max-per-target-per-hour` sends within the last hour. Blocked messages
//! are deferred without spending a token or an attempt.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{IdentityConfig, TargetActivity};
use crate::error::{DispatchError, DispatchResult};
use crate::store::{self, CasOutcome, StateStore, keys};

const MAX_CAS_RETRIES: usize = 32;

// TODO: delete records of targets idle for a full window during engine cleanup

/// Store-backed per-target send history
#[derive(Clone)]
pub struct TargetCooldown {
    store: Arc<dyn StateStore>,
}

impl TargetCooldown {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// When `target` may next be sent to, if it is blocked at `now`
    pub async fn check(&self, identity: &IdentityConfig, target: &str, now: i64) -> DispatchResult<Option<i64>> {
        if !identity.has_target_limits() {
            return Ok(None);
        }

        let key = keys::target(&identity.identity_id, target);
        let free_at = store::load::<TargetActivity>(self.store.as_ref(), &key)
            .await?
            .and_then(|(activity, _)| {
                activity.free_at(identity.target_cooldown_ms, identity.max_per_target_per_hour, now)
            });

        if let Some(free_at) = free_at {
            debug!(identity_id = %identity.identity_id, %target, free_at, "check: target cooling down");
        }
        Ok(free_at)
    }

    /// Note a successful send to `target`
    pub async fn record(&self, identity: &IdentityConfig, target: &str, now: i64) -> DispatchResult<()> {
        if !identity.has_target_limits() {
            return Ok(());
        }

        let key = keys::target(&identity.identity_id, target);
        for _ in 0..MAX_CAS_RETRIES {
            let (mut activity, version) = match store::load::<TargetActivity>(self.store.as_ref(), &key).await? {
                Some((activity, version)) => (activity, Some(version)),
                None => (TargetActivity::new(&identity.identity_id, target), None),
            };
            activity.record(identity.max_per_target_per_hour, now);

            match store::save(self.store.as_ref(), &key, version, &activity).await? {
                CasOutcome::Written { .. } => return Ok(()),
                CasOutcome::Conflict { .. } => {
                    debug!(identity_id = %identity.identity_id, %target, "record: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!(
            "too much contention on target {} of {}",
            target, identity.identity_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TARGET_WINDOW_MS;
    use crate::store::MemoryStore;

    fn identity() -> IdentityConfig {
        IdentityConfig::new("bot-a", 10, 1_000, 3, 100, 1_000).with_target_limits(5_000, 2)
    }

    #[tokio::test]
    async fn test_unlimited_identity_never_blocks() {
        let store = Arc::new(MemoryStore::new());
        let cooldown = TargetCooldown::new(store.clone());
        let id = IdentityConfig::new("bot-a", 10, 1_000, 3, 100, 1_000);

        cooldown.record(&id, "chat-1", 0).await.unwrap();
        assert_eq!(cooldown.check(&id, "chat-1", 1).await.unwrap(), None);
        assert!(store.get(&keys::target("bot-a", "chat-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gap_then_hourly_cap() {
        let cooldown = TargetCooldown::new(Arc::new(MemoryStore::new()));
        let id = identity();

        assert_eq!(cooldown.check(&id, "chat-1", 0).await.unwrap(), None);
        cooldown.record(&id, "chat-1", 0).await.unwrap();
        assert_eq!(cooldown.check(&id, "chat-1", 1_000).await.unwrap(), Some(5_000));

        // Other chats are unaffected
        assert_eq!(cooldown.check(&id, "chat-2", 1_000).await.unwrap(), None);

        cooldown.record(&id, "chat-1", 5_000).await.unwrap();
        assert_eq!(
            cooldown.check(&id, "chat-1", 10_000).await.unwrap(),
            Some(TARGET_WINDOW_MS)
        );
        assert_eq!(cooldown.check(&id, "chat-1", TARGET_WINDOW_MS).await.unwrap(), None);
    }
}
