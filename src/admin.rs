//! Producer and operator facades over the shared store

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::control::IdentityControl;
use crate::domain::{Message, NewMessage};
use crate::engine::Wakers;
use crate::error::DispatchResult;
use crate::lease::LeaseManager;
use crate::pool::{CancelOutcome, EnqueueOutcome, MessagePool};
use crate::store::StateStore;

/// Enqueue entry point for message producers
#[derive(Clone)]
pub struct Producer {
    pool: MessagePool,
    clock: Arc<dyn Clock>,
    wakers: Option<Wakers>,
}

impl Producer {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: MessagePool::new(store),
            clock,
            wakers: None,
        }
    }

    /// Wake local workers on enqueue
    pub fn with_wakers(mut self, wakers: Wakers) -> Self {
        self.wakers = Some(wakers);
        self
    }

    /// Add a message to its identity's pool
    ///
    /// A known id is a no-op reported as [`EnqueueOutcome::Duplicate`].
    pub async fn enqueue(&self, new: NewMessage) -> DispatchResult<EnqueueOutcome> {
        let identity_id = new.identity_id.clone();
        let outcome = self.pool.enqueue(new, self.clock.now_ms()).await?;

        if !outcome.is_duplicate()
            && let Some(wakers) = &self.wakers
        {
            let woken = wakers.wake(&identity_id).await;
            debug!(%identity_id, woken, "enqueue: wake sent");
        }
        Ok(outcome)
    }
}

/// Point-in-time view of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityReport {
    pub identity_id: String,
    pub pending_count: usize,
    pub dead_letter_count: usize,
    pub failed_count: usize,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub paused: bool,
    pub online: bool,
    pub sent_count: u64,
}

/// Operator interface
#[derive(Clone)]
pub struct Admin {
    pool: MessagePool,
    control: IdentityControl,
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
}

impl Admin {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: MessagePool::new(store.clone()),
            control: IdentityControl::new(store.clone()),
            leases: LeaseManager::new(store),
            clock,
        }
    }

    /// Stop dispatching for an identity; its worker steps down on the next tick
    pub async fn pause(&self, identity_id: &str) -> DispatchResult<()> {
        self.control.set_paused(identity_id, true).await?;
        info!(%identity_id, "Identity paused");
        Ok(())
    }

    pub async fn resume(&self, identity_id: &str) -> DispatchResult<()> {
        self.control.set_paused(identity_id, false).await?;
        info!(%identity_id, "Identity resumed");
        Ok(())
    }

    /// Cancel a pending message; in-flight messages are not interrupted
    pub async fn cancel(&self, message_id: &str) -> DispatchResult<CancelOutcome> {
        self.pool.cancel(message_id, self.clock.now_ms()).await
    }

    pub async fn inspect(&self, identity_id: &str) -> DispatchResult<IdentityReport> {
        debug!(%identity_id, "inspect: called");
        let state = self.control.get(identity_id).await?;
        let lease = self.leases.holder(identity_id, self.clock.now_ms()).await?;

        Ok(IdentityReport {
            identity_id: identity_id.to_string(),
            pending_count: self.pool.pending_count(identity_id).await?,
            dead_letter_count: self.pool.dead_letter_count(identity_id).await?,
            failed_count: self.pool.failed_count(identity_id).await?,
            lease_expires_at: lease.as_ref().map(|l| l.expires_at),
            lease_holder: lease.map(|l| l.holder_token),
            last_error: state.last_error,
            last_error_at: state.last_error_at,
            paused: state.paused,
            online: state.online,
            sent_count: state.sent_count,
        })
    }

    /// Dead-lettered and failed messages, oldest first
    pub async fn dead_letters(&self, identity_id: &str, limit: usize) -> DispatchResult<Vec<Message>> {
        self.pool.list_dead_letters(identity_id, limit).await
    }

    /// Messages still waiting for dispatch, in dispatch order
    pub async fn pending(&self, identity_id: &str, limit: usize) -> DispatchResult<Vec<Message>> {
        self.pool.active(identity_id, limit).await
    }

    pub async fn message(&self, message_id: &str) -> DispatchResult<Option<Message>> {
        self.pool.get(message_id).await
    }

    /// Delete terminal messages finished more than `older_than_ms` ago
    pub async fn purge(&self, identity_id: &str, older_than_ms: u64) -> DispatchResult<usize> {
        let cutoff = self.clock.now_ms() - older_than_ms as i64;
        self.pool.purge_terminal(identity_id, cutoff).await
    }
}
