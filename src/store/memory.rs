//! In-process store

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{CasOutcome, IndexEntry, StateStore, StoreError, StoreResult, Versioned};

#[derive(Debug, Default)]
struct OrderedIndex {
    by_member: HashMap<String, (i64, u64)>,
    order: BTreeSet<(i64, u64, String)>,
}

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<String, Versioned>,
    indexes: HashMap<String, OrderedIndex>,
    counters: HashMap<String, u64>,
    last_version: u64,
}

/// Mutex-guarded maps implementing [`StateStore`]
///
/// Shared between components through `Arc`, which makes it behave like one
/// store reached by several processes. `set_available(false)` simulates an
/// outage: every call fails with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        debug!(%available, "MemoryStore::set_available: called");
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {}", e)))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let inner = self.lock()?;
        Ok(inner.kv.get(key).cloned())
    }

    async fn cas_write(&self, key: &str, expected: Option<u64>, new: Option<String>) -> StoreResult<CasOutcome> {
        let mut inner = self.lock()?;
        let current = inner.kv.get(key).map(|v| v.version);
        if current != expected {
            return Ok(CasOutcome::Conflict { current });
        }

        match new {
            Some(value) => {
                inner.last_version += 1;
                let version = inner.last_version;
                inner.kv.insert(key.to_string(), Versioned { value, version });
                Ok(CasOutcome::Written { version })
            }
            None => {
                inner.kv.remove(key);
                Ok(CasOutcome::Written { version: 0 })
            }
        }
    }

    async fn index_put(&self, index: &str, entry: IndexEntry) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let idx = inner.indexes.entry(index.to_string()).or_default();
        if let Some((score, seq)) = idx.by_member.remove(&entry.member) {
            idx.order.remove(&(score, seq, entry.member.clone()));
        }
        idx.by_member.insert(entry.member.clone(), (entry.score, entry.seq));
        idx.order.insert((entry.score, entry.seq, entry.member));
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let Some(idx) = inner.indexes.get_mut(index) else {
            return Ok(false);
        };
        match idx.by_member.remove(member) {
            Some((score, seq)) => {
                idx.order.remove(&(score, seq, member.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ordered_read(&self, index: &str, up_to: i64, limit: usize) -> StoreResult<Vec<IndexEntry>> {
        let inner = self.lock()?;
        let Some(idx) = inner.indexes.get(index) else {
            return Ok(Vec::new());
        };
        Ok(idx
            .order
            .iter()
            .take_while(|(score, _, _)| *score <= up_to)
            .take(limit)
            .map(|(score, seq, member)| IndexEntry::new(*score, *seq, member.clone()))
            .collect())
    }

    async fn index_len(&self, index: &str) -> StoreResult<usize> {
        let inner = self.lock()?;
        Ok(inner.indexes.get(index).map(|idx| idx.by_member.len()).unwrap_or(0))
    }

    async fn next_seq(&self, counter: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let value = inner.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}
