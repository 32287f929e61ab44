//! Message pool
//!
//! Per-identity queue of dispatchable messages. Records live at `msg:{id}`;
//! the `due:{identity}` index orders them by due time, then priority, then
//! insertion sequence. Terminal records leave the active index and are
//! filed under `dead:{identity}` or `done:{identity}` until purged.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{Message, MessageStatus, NewMessage};
use crate::error::{DispatchError, DispatchResult};
use crate::store::{self, CasOutcome, IndexEntry, StateStore, keys};

/// Entries fetched per index read
const SCAN_BATCH: usize = 32;

/// Give up a conditional update after this many conflicts in a row
const MAX_CAS_RETRIES: usize = 32;

/// Position of a dispatchable message in its identity's due index
fn due_entry(message: &Message) -> IndexEntry {
    IndexEntry::new(message.due_at(), message.order_key(), &message.id)
}

/// Result of [`MessagePool::enqueue`]
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Accepted(Message),
    /// The id is already known; nothing was written
    Duplicate(Message),
}

impl EnqueueOutcome {
    pub fn message(&self) -> &Message {
        match self {
            EnqueueOutcome::Accepted(m) | EnqueueOutcome::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// Result of [`MessagePool::transition`]
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Change written; holds the new record
    Applied(Message),
    /// Record was terminal or the closure declined; holds the current record
    Refused(Message),
}

/// Result of [`MessagePool::cancel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Leased by a worker; the send may already be under way
    InFlight,
    AlreadyTerminal(MessageStatus),
    NotFound,
}

/// Store-backed message pool
#[derive(Clone)]
pub struct MessagePool {
    store: Arc<dyn StateStore>,
}

impl MessagePool {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Add a message; a known id is never written twice
    pub async fn enqueue(&self, new: NewMessage, now: i64) -> DispatchResult<EnqueueOutcome> {
        debug!(identity_id = %new.identity_id, id = ?new.id, priority = %new.priority, "enqueue: called");

        if new.recurrence.as_ref().is_some_and(|r| r.every_ms == 0) {
            return Err(DispatchError::InvalidConfig(
                "recurring message needs a positive period".to_string(),
            ));
        }

        if let Some(id) = &new.id
            && let Some(existing) = self.get(id).await?
        {
            self.reassert_index(&existing).await?;
            return Ok(EnqueueOutcome::Duplicate(existing));
        }

        let seq = self.store.next_seq(keys::MESSAGE_SEQ).await?;
        let message = new.into_message(seq, now);

        match store::save(self.store.as_ref(), &keys::message(&message.id), None, &message).await? {
            CasOutcome::Written { .. } => {}
            CasOutcome::Conflict { .. } => {
                // Lost a race with another producer using the same id
                let existing = self
                    .get(&message.id)
                    .await?
                    .ok_or_else(|| DispatchError::NotFound(message.id.clone()))?;
                return Ok(EnqueueOutcome::Duplicate(existing));
            }
        }

        self.store
            .index_put(&keys::due_index(&message.identity_id), due_entry(&message))
            .await?;

        info!(id = %message.id, identity_id = %message.identity_id, seq, "Message enqueued");
        Ok(EnqueueOutcome::Accepted(message))
    }

    /// A record written before a crash may be missing from the active index
    async fn reassert_index(&self, existing: &Message) -> DispatchResult<()> {
        if existing.status.is_dispatchable() {
            self.store
                .index_put(&keys::due_index(&existing.identity_id), due_entry(existing))
                .await?;
        }
        Ok(())
    }

    /// Earliest-due dispatchable message of the identity, without removing it
    pub async fn peek_due(&self, identity_id: &str, now: i64) -> DispatchResult<Option<Message>> {
        debug!(%identity_id, now, "peek_due: called");
        let index = keys::due_index(identity_id);

        loop {
            let entries = self.store.ordered_read(&index, now, SCAN_BATCH).await?;
            if entries.is_empty() {
                return Ok(None);
            }

            for entry in entries {
                match self.get(&entry.member).await? {
                    Some(message) if message.is_due(now) => return Ok(Some(message)),
                    Some(message) if message.status.is_dispatchable() => {
                        // Index position is behind the record; move it
                        self.store.index_put(&index, due_entry(&message)).await?;
                    }
                    Some(message) => {
                        debug!(id = %message.id, status = %message.status, "peek_due: dropping terminal entry");
                        self.store.index_remove(&index, &entry.member).await?;
                        self.file_terminal(&message).await?;
                    }
                    None => {
                        warn!(member = %entry.member, "peek_due: dropping entry without record");
                        self.store.index_remove(&index, &entry.member).await?;
                    }
                }
            }
        }
    }

    /// Drop a message from the active index; terminal records are filed for
    /// retention
    pub async fn remove(&self, message_id: &str) -> DispatchResult<bool> {
        debug!(%message_id, "remove: called");
        let message = self
            .get(message_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(message_id.to_string()))?;

        let removed = self
            .store
            .index_remove(&keys::due_index(&message.identity_id), message_id)
            .await?;
        self.file_terminal(&message).await?;
        Ok(removed)
    }

    async fn file_terminal(&self, message: &Message) -> DispatchResult<()> {
        let index = match message.status {
            MessageStatus::DeadLettered | MessageStatus::Failed => keys::dead_index(&message.identity_id),
            MessageStatus::Sent | MessageStatus::Cancelled => keys::done_index(&message.identity_id),
            MessageStatus::Pending | MessageStatus::Leased => return Ok(()),
        };
        let finished = message.finished_at.unwrap_or(message.updated_at);
        self.store
            .index_put(&index, IndexEntry::new(finished, message.seq, &message.id))
            .await?;
        Ok(())
    }

    /// Schedule a retry: back to `Pending`, due at `next_retry_at`
    pub async fn requeue(&self, message_id: &str, next_retry_at: i64, now: i64) -> DispatchResult<Transition> {
        debug!(%message_id, next_retry_at, "requeue: called");
        let outcome = self
            .transition(message_id, |m| {
                m.next_retry_at = Some(next_retry_at);
                m.set_status(MessageStatus::Pending, now);
                true
            })
            .await?;

        if let Transition::Applied(message) = &outcome {
            self.store
                .index_put(&keys::due_index(&message.identity_id), due_entry(message))
                .await?;
        }
        Ok(outcome)
    }

    /// Count a failed attempt and schedule the retry in one write
    pub async fn record_retry(
        &self,
        message_id: &str,
        error: &str,
        next_retry_at: i64,
        now: i64,
    ) -> DispatchResult<Transition> {
        debug!(%message_id, %error, next_retry_at, "record_retry: called");
        let outcome = self
            .transition(message_id, |m| {
                m.attempt_count += 1;
                m.set_error(error, now);
                m.next_retry_at = Some(next_retry_at);
                m.set_status(MessageStatus::Pending, now);
                true
            })
            .await?;

        if let Transition::Applied(message) = &outcome {
            self.store
                .index_put(&keys::due_index(&message.identity_id), due_entry(message))
                .await?;
        }
        Ok(outcome)
    }

    /// Enqueue the next occurrence of a recurring message
    ///
    /// `None` for one-off messages and finished series. Safe to repeat: the
    /// occurrence id is deterministic.
    pub async fn schedule_next(&self, message: &Message, now: i64) -> DispatchResult<Option<EnqueueOutcome>> {
        let Some(next) = message.next_occurrence(now) else {
            return Ok(None);
        };
        debug!(id = %message.id, next_at = next.scheduled_at, "schedule_next: called");
        Ok(Some(self.enqueue(next, now).await?))
    }

    pub async fn get(&self, message_id: &str) -> DispatchResult<Option<Message>> {
        let loaded = store::load::<Message>(self.store.as_ref(), &keys::message(message_id)).await?;
        Ok(loaded.map(|(message, _)| message))
    }

    /// Conditionally update a record
    ///
    /// Terminal records are never touched. `apply` runs against the latest
    /// record on every attempt and may decline by returning `false`.
    pub async fn transition<F>(&self, message_id: &str, mut apply: F) -> DispatchResult<Transition>
    where
        F: FnMut(&mut Message) -> bool + Send,
    {
        let key = keys::message(message_id);

        for _ in 0..MAX_CAS_RETRIES {
            let (current, version) = store::load::<Message>(self.store.as_ref(), &key)
                .await?
                .ok_or_else(|| DispatchError::NotFound(message_id.to_string()))?;

            if current.is_terminal() {
                return Ok(Transition::Refused(current));
            }

            let mut next = current.clone();
            if !apply(&mut next) {
                return Ok(Transition::Refused(current));
            }

            match store::save(self.store.as_ref(), &key, Some(version), &next).await? {
                CasOutcome::Written { .. } => return Ok(Transition::Applied(next)),
                CasOutcome::Conflict { .. } => {
                    debug!(%message_id, "transition: conflict, retrying");
                }
            }
        }

        Err(DispatchError::Store(format!("too much contention updating {}", message_id)))
    }

    /// Operator cancel of a not-yet-sent message
    pub async fn cancel(&self, message_id: &str, now: i64) -> DispatchResult<CancelOutcome> {
        debug!(%message_id, "cancel: called");
        let result = self
            .transition(message_id, |m| {
                if m.status != MessageStatus::Pending {
                    return false;
                }
                m.set_status(MessageStatus::Cancelled, now);
                true
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(DispatchError::NotFound(_)) => return Ok(CancelOutcome::NotFound),
            Err(e) => return Err(e),
        };

        match outcome {
            Transition::Applied(_) => {
                self.remove(message_id).await?;
                info!(%message_id, "Message cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            Transition::Refused(current) if current.status == MessageStatus::Leased => Ok(CancelOutcome::InFlight),
            Transition::Refused(current) => Ok(CancelOutcome::AlreadyTerminal(current.status)),
        }
    }

    /// Messages currently in the active index (any due time), in order
    pub async fn active(&self, identity_id: &str, limit: usize) -> DispatchResult<Vec<Message>> {
        self.load_index(&keys::due_index(identity_id), limit).await
    }

    /// Dead-lettered and failed messages, oldest first
    pub async fn list_dead_letters(&self, identity_id: &str, limit: usize) -> DispatchResult<Vec<Message>> {
        debug!(%identity_id, limit, "list_dead_letters: called");
        self.load_index(&keys::dead_index(identity_id), limit).await
    }

    async fn load_index(&self, index: &str, limit: usize) -> DispatchResult<Vec<Message>> {
        let entries = self.store.ordered_read(index, i64::MAX, limit).await?;
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(message) = self.get(&entry.member).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    pub async fn pending_count(&self, identity_id: &str) -> DispatchResult<usize> {
        Ok(self.store.index_len(&keys::due_index(identity_id)).await?)
    }

    /// Messages dead-lettered after a permanent failure
    pub async fn dead_letter_count(&self, identity_id: &str) -> DispatchResult<usize> {
        Ok(self.dead_tally(identity_id).await?.0)
    }

    /// Messages that exhausted their retry budget
    pub async fn failed_count(&self, identity_id: &str) -> DispatchResult<usize> {
        Ok(self.dead_tally(identity_id).await?.1)
    }

    async fn dead_tally(&self, identity_id: &str) -> DispatchResult<(usize, usize)> {
        let messages = self.load_index(&keys::dead_index(identity_id), usize::MAX).await?;
        let dead = messages
            .iter()
            .filter(|m| m.status == MessageStatus::DeadLettered)
            .count();
        Ok((dead, messages.len() - dead))
    }

    /// Delete terminal records of the identity that finished at or before
    /// `cutoff`
    pub async fn purge_terminal(&self, identity_id: &str, cutoff: i64) -> DispatchResult<usize> {
        debug!(%identity_id, cutoff, "purge_terminal: called");
        let mut purged = 0;

        for index in [keys::done_index(identity_id), keys::dead_index(identity_id)] {
            loop {
                let entries = self.store.ordered_read(&index, cutoff, SCAN_BATCH).await?;
                if entries.is_empty() {
                    break;
                }
                for entry in entries {
                    let key = keys::message(&entry.member);
                    if let Some((message, version)) = store::load::<Message>(self.store.as_ref(), &key).await?
                        && message.is_terminal()
                        && self.store.cas_write(&key, Some(version), None).await?.is_written()
                    {
                        purged += 1;
                    }
                    self.store.index_remove(&index, &entry.member).await?;
                }
            }
        }

        if purged > 0 {
            info!(%identity_id, purged, "Purged terminal messages");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessagePriority;
    use crate::store::MemoryStore;

    fn pool() -> MessagePool {
        MessagePool::new(Arc::new(MemoryStore::new()))
    }

    async fn enqueue(pool: &MessagePool, id: &str, scheduled_at: i64) -> Message {
        let outcome = pool
            .enqueue(NewMessage::new("bot-a", "chat-1", "hi", scheduled_at).with_id(id), 0)
            .await
            .unwrap();
        outcome.message().clone()
    }

    async fn finish(pool: &MessagePool, id: &str, status: MessageStatus, now: i64) {
        let outcome = pool
            .transition(id, |m| {
                m.set_status(status, now);
                true
            })
            .await
            .unwrap();
        assert!(matches!(outcome, Transition::Applied(_)));
        pool.remove(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_and_peek() {
        let pool = pool();
        let message = enqueue(&pool, "m1", 100).await;
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempt_count, 0);

        assert!(pool.peek_due("bot-a", 99).await.unwrap().is_none());
        let due = pool.peek_due("bot-a", 100).await.unwrap().unwrap();
        assert_eq!(due.id, "m1");

        // Peek does not remove
        assert!(pool.peek_due("bot-a", 100).await.unwrap().is_some());
        assert_eq!(pool.pending_count("bot-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_is_noop() {
        let pool = pool();
        enqueue(&pool, "m1", 100).await;

        let outcome = pool
            .enqueue(NewMessage::new("bot-a", "other", "changed", 5).with_id("m1"), 0)
            .await
            .unwrap();
        assert!(outcome.is_duplicate());
        assert_eq!(outcome.message().payload, "hi");
        assert_eq!(pool.pending_count("bot-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_of_sent_id_stays_sent() {
        let pool = pool();
        enqueue(&pool, "m1", 0).await;
        finish(&pool, "m1", MessageStatus::Sent, 10).await;

        let outcome = pool
            .enqueue(NewMessage::new("bot-a", "chat-1", "hi", 0).with_id("m1"), 20)
            .await
            .unwrap();
        assert!(outcome.is_duplicate());
        assert!(pool.peek_due("bot-a", 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_on_equal_due_time() {
        let pool = pool();
        enqueue(&pool, "late", 200).await;
        enqueue(&pool, "first", 100).await;
        enqueue(&pool, "second", 100).await;

        let due = pool.peek_due("bot-a", 1_000).await.unwrap().unwrap();
        assert_eq!(due.id, "first");
        finish(&pool, "first", MessageStatus::Sent, 1_000).await;

        let due = pool.peek_due("bot-a", 1_000).await.unwrap().unwrap();
        assert_eq!(due.id, "second");
        finish(&pool, "second", MessageStatus::Sent, 1_000).await;

        let due = pool.peek_due("bot-a", 1_000).await.unwrap().unwrap();
        assert_eq!(due.id, "late");
    }

    #[tokio::test]
    async fn test_priority_breaks_ties_within_due_time() {
        let pool = pool();
        enqueue(&pool, "normal", 100).await;
        pool.enqueue(
            NewMessage::new("bot-a", "chat-1", "hi", 100)
                .with_id("urgent")
                .with_priority(MessagePriority::Urgent),
            0,
        )
        .await
        .unwrap();
        pool.enqueue(
            NewMessage::new("bot-a", "chat-1", "hi", 200)
                .with_id("urgent-later")
                .with_priority(MessagePriority::Urgent),
            0,
        )
        .await
        .unwrap();
        pool.enqueue(
            NewMessage::new("bot-a", "chat-1", "hi", 50)
                .with_id("low-earlier")
                .with_priority(MessagePriority::Low),
            0,
        )
        .await
        .unwrap();

        let mut order = Vec::new();
        while let Some(message) = pool.peek_due("bot-a", 1_000).await.unwrap() {
            order.push(message.id.clone());
            finish(&pool, &message.id, MessageStatus::Sent, 1_000).await;
        }
        assert_eq!(order, vec!["low-earlier", "urgent", "normal", "urgent-later"]);
    }

    #[tokio::test]
    async fn test_schedule_next_enqueues_once() {
        let pool = pool();
        pool.enqueue(
            NewMessage::new("bot-a", "chat-1", "digest", 100)
                .with_id("d")
                .repeating(1_000, Some(2)),
            0,
        )
        .await
        .unwrap();
        finish(&pool, "d", MessageStatus::Sent, 150).await;
        let sent = pool.get("d").await.unwrap().unwrap();

        let outcome = pool.schedule_next(&sent, 150).await.unwrap().unwrap();
        assert!(!outcome.is_duplicate());
        assert_eq!(outcome.message().id, "d.2");
        assert_eq!(outcome.message().scheduled_at, 1_100);

        // Repeated after a crash: same occurrence, not a new one
        assert!(pool.schedule_next(&sent, 160).await.unwrap().unwrap().is_duplicate());
        assert_eq!(pool.pending_count("bot-a").await.unwrap(), 1);

        finish(&pool, "d.2", MessageStatus::Sent, 1_100).await;
        let last = pool.get("d.2").await.unwrap().unwrap();
        assert!(pool.schedule_next(&last, 1_100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_zero_period() {
        let pool = pool();
        let result = pool
            .enqueue(NewMessage::new("bot-a", "chat-1", "hi", 0).repeating(0, None), 0)
            .await;
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_requeue_moves_due_time_and_keeps_seq() {
        let pool = pool();
        let original = enqueue(&pool, "m1", 0).await;
        enqueue(&pool, "m2", 50).await;

        let outcome = pool.requeue("m1", 500, 10).await.unwrap();
        let Transition::Applied(requeued) = outcome else {
            panic!("requeue refused");
        };
        assert_eq!(requeued.seq, original.seq);
        assert_eq!(requeued.next_retry_at, Some(500));

        let due = pool.peek_due("bot-a", 100).await.unwrap().unwrap();
        assert_eq!(due.id, "m2");
        assert_eq!(pool.peek_due("bot-a", 500).await.unwrap().unwrap().id, "m2");
    }

    #[tokio::test]
    async fn test_record_retry_counts_attempt() {
        let pool = pool();
        enqueue(&pool, "m1", 0).await;

        pool.record_retry("m1", "timeout", 300, 10).await.unwrap();
        let message = pool.get("m1").await.unwrap().unwrap();
        assert_eq!(message.attempt_count, 1);
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.last_error.as_deref(), Some("timeout"));
        assert!(pool.peek_due("bot-a", 299).await.unwrap().is_none());
        assert!(pool.peek_due("bot-a", 300).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transition_refuses_terminal() {
        let pool = pool();
        enqueue(&pool, "m1", 0).await;
        finish(&pool, "m1", MessageStatus::Sent, 10).await;

        let outcome = pool
            .transition("m1", |m| {
                m.set_status(MessageStatus::Pending, 20);
                true
            })
            .await
            .unwrap();
        let Transition::Refused(current) = outcome else {
            panic!("terminal record was modified");
        };
        assert_eq!(current.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_cancel_outcomes() {
        let pool = pool();
        enqueue(&pool, "pending", 0).await;
        enqueue(&pool, "leased", 0).await;
        pool.transition("leased", |m| {
            m.set_status(MessageStatus::Leased, 1);
            true
        })
        .await
        .unwrap();

        assert_eq!(pool.cancel("pending", 5).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            pool.cancel("pending", 6).await.unwrap(),
            CancelOutcome::AlreadyTerminal(MessageStatus::Cancelled)
        );
        assert_eq!(pool.cancel("leased", 5).await.unwrap(), CancelOutcome::InFlight);
        assert_eq!(pool.cancel("missing", 5).await.unwrap(), CancelOutcome::NotFound);

        let active: Vec<_> = pool
            .active("bot-a", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(active, vec!["leased".to_string()]);
    }

    #[tokio::test]
    async fn test_dead_letter_listing_and_counts() {
        let pool = pool();
        enqueue(&pool, "perm", 0).await;
        enqueue(&pool, "exhausted", 0).await;
        finish(&pool, "perm", MessageStatus::DeadLettered, 10).await;
        finish(&pool, "exhausted", MessageStatus::Failed, 20).await;

        let dead = pool.list_dead_letters("bot-a", 10).await.unwrap();
        let ids: Vec<_> = dead.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["perm", "exhausted"]);
        assert_eq!(pool.dead_letter_count("bot-a").await.unwrap(), 1);
        assert_eq!(pool.failed_count("bot-a").await.unwrap(), 1);
        assert_eq!(pool.pending_count("bot-a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_terminal_respects_cutoff() {
        let pool = pool();
        enqueue(&pool, "old", 0).await;
        enqueue(&pool, "new", 0).await;
        enqueue(&pool, "live", 0).await;
        finish(&pool, "old", MessageStatus::Sent, 100).await;
        finish(&pool, "new", MessageStatus::DeadLettered, 900).await;

        let purged = pool.purge_terminal("bot-a", 500).await.unwrap();
        assert_eq!(purged, 1);
        assert!(pool.get("old").await.unwrap().is_none());
        assert!(pool.get("new").await.unwrap().is_some());
        assert!(pool.get("live").await.unwrap().is_some());

        assert_eq!(pool.purge_terminal("bot-a", 1_000).await.unwrap(), 1);
        assert!(pool.list_dead_letters("bot-a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_repairs_missing_index_entry() {
        let store = Arc::new(MemoryStore::new());
        let pool = MessagePool::new(store.clone());
        enqueue(&pool, "m1", 0).await;

        // Simulate a crash between record write and index insert
        store.index_remove("due:bot-a", "m1").await.unwrap();
        assert!(pool.peek_due("bot-a", 10).await.unwrap().is_none());

        let outcome = pool
            .enqueue(NewMessage::new("bot-a", "chat-1", "hi", 0).with_id("m1"), 5)
            .await
            .unwrap();
        assert!(outcome.is_duplicate());
        assert_eq!(pool.peek_due("bot-a", 10).await.unwrap().unwrap().id, "m1");
    }

    #[tokio::test]
    async fn test_peek_drops_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        let pool = MessagePool::new(store.clone());
        store
            .index_put("due:bot-a", IndexEntry::new(0, 0, "ghost"))
            .await
            .unwrap();
        enqueue(&pool, "m1", 10).await;

        assert_eq!(pool.peek_due("bot-a", 10).await.unwrap().unwrap().id, "m1");
        assert_eq!(pool.pending_count("bot-a").await.unwrap(), 1);
    }
}
