//! SqliteStore - actor that owns a rusqlite connection
//!
//! Several processes may open the same database file; SQLite's write lock
//! serializes their conditional writes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::StoreCommand;
use super::{CasOutcome, IndexEntry, StateStore, StoreError, StoreResult, Versioned};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS idx (
    name TEXT NOT NULL,
    member TEXT NOT NULL,
    score INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (name, member)
);
CREATE INDEX IF NOT EXISTS idx_order ON idx (name, score, seq);
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

/// Store-wide version counter, kept apart from caller counters
const VERSION_COUNTER: &str = "__kv_version";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to send commands to the SqliteStore actor
#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl SqliteStore {
    /// Open (or create) a database file and spawn the actor
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SqliteStore::open: called");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::spawn(conn)
    }

    /// Private in-memory database, for tests
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("SqliteStore::open_in_memory: called");
        Self::spawn(Connection::open_in_memory()?)
    }

    fn spawn(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        let (tx, rx) = mpsc::channel(256);

        // rusqlite calls block; keep them off the async workers
        tokio::task::spawn_blocking(move || actor_loop(conn, rx));

        info!("SqliteStore spawned");
        Ok(Self { tx })
    }

    /// Stop the actor; later calls fail with `Unavailable`
    pub async fn shutdown(&self) -> StoreResult<()> {
        debug!("SqliteStore::shutdown: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| channel_closed())?;
        reply_rx.await.map_err(|_| channel_closed())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> StoreCommand) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| channel_closed())?;
        reply_rx.await.map_err(|_| channel_closed())?
    }
}

fn channel_closed() -> StoreError {
    StoreError::Unavailable("store actor stopped".to_string())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let key = key.to_string();
        self.request(|reply| StoreCommand::Get { key, reply }).await
    }

    async fn cas_write(&self, key: &str, expected: Option<u64>, new: Option<String>) -> StoreResult<CasOutcome> {
        let key = key.to_string();
        self.request(|reply| StoreCommand::CasWrite {
            key,
            expected,
            new,
            reply,
        })
        .await
    }

    async fn index_put(&self, index: &str, entry: IndexEntry) -> StoreResult<()> {
        let index = index.to_string();
        self.request(|reply| StoreCommand::IndexPut { index, entry, reply })
            .await
    }

    async fn index_remove(&self, index: &str, member: &str) -> StoreResult<bool> {
        let index = index.to_string();
        let member = member.to_string();
        self.request(|reply| StoreCommand::IndexRemove { index, member, reply })
            .await
    }

    async fn ordered_read(&self, index: &str, up_to: i64, limit: usize) -> StoreResult<Vec<IndexEntry>> {
        let index = index.to_string();
        self.request(|reply| StoreCommand::OrderedRead {
            index,
            up_to,
            limit,
            reply,
        })
        .await
    }

    async fn index_len(&self, index: &str) -> StoreResult<usize> {
        let index = index.to_string();
        self.request(|reply| StoreCommand::IndexLen { index, reply }).await
    }

    async fn next_seq(&self, counter: &str) -> StoreResult<u64> {
        let counter = counter.to_string();
        self.request(|reply| StoreCommand::NextSeq { counter, reply }).await
    }
}

fn actor_loop(mut conn: Connection, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("SqliteStore actor started");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCommand::Get { key, reply } => {
                let _ = reply.send(get(&conn, &key));
            }
            StoreCommand::CasWrite {
                key,
                expected,
                new,
                reply,
            } => {
                let result = cas_write(&mut conn, &key, expected, new);
                if let Err(e) = &result {
                    warn!(%key, error = %e, "actor_loop: CasWrite failed");
                }
                let _ = reply.send(result);
            }
            StoreCommand::IndexPut { index, entry, reply } => {
                let _ = reply.send(index_put(&conn, &index, &entry));
            }
            StoreCommand::IndexRemove { index, member, reply } => {
                let _ = reply.send(index_remove(&conn, &index, &member));
            }
            StoreCommand::OrderedRead {
                index,
                up_to,
                limit,
                reply,
            } => {
                let _ = reply.send(ordered_read(&conn, &index, up_to, limit));
            }
            StoreCommand::IndexLen { index, reply } => {
                let _ = reply.send(index_len(&conn, &index));
            }
            StoreCommand::NextSeq { counter, reply } => {
                let result = bump_counter(&conn, &counter).map_err(StoreError::from);
                let _ = reply.send(result);
            }
            StoreCommand::Shutdown { reply } => {
                info!("SqliteStore actor shutting down");
                let _ = reply.send(());
                break;
            }
        }
    }

    debug!("SqliteStore actor stopped");
}

fn get(conn: &Connection, key: &str) -> StoreResult<Option<Versioned>> {
    let row = conn
        .query_row("SELECT value, version FROM kv WHERE key = ?1", params![key], |row| {
            Ok(Versioned {
                value: row.get(0)?,
                version: row.get::<_, i64>(1)? as u64,
            })
        })
        .optional()?;
    Ok(row)
}

fn cas_write(conn: &mut Connection, key: &str, expected: Option<u64>, new: Option<String>) -> StoreResult<CasOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current = tx
        .query_row("SELECT version FROM kv WHERE key = ?1", params![key], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?
        .map(|v| v as u64);

    if current != expected {
        // Dropping the transaction rolls it back
        return Ok(CasOutcome::Conflict { current });
    }

    let outcome = match new {
        Some(value) => {
            let version = bump_counter(&tx, VERSION_COUNTER)?;
            tx.execute(
                "INSERT INTO kv (key, value, version) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
                params![key, value, version as i64],
            )?;
            CasOutcome::Written { version }
        }
        None => {
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            CasOutcome::Written { version: 0 }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

fn index_put(conn: &Connection, index: &str, entry: &IndexEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO idx (name, member, score, seq) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name, member) DO UPDATE SET score = excluded.score, seq = excluded.seq",
        params![index, entry.member, entry.score, entry.seq as i64],
    )?;
    Ok(())
}

fn index_remove(conn: &Connection, index: &str, member: &str) -> StoreResult<bool> {
    let removed = conn.execute(
        "DELETE FROM idx WHERE name = ?1 AND member = ?2",
        params![index, member],
    )?;
    Ok(removed > 0)
}

fn ordered_read(conn: &Connection, index: &str, up_to: i64, limit: usize) -> StoreResult<Vec<IndexEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT score, seq, member FROM idx
         WHERE name = ?1 AND score <= ?2
         ORDER BY score ASC, seq ASC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![index, up_to, limit as i64], |row| {
        Ok(IndexEntry {
            score: row.get(0)?,
            seq: row.get::<_, i64>(1)? as u64,
            member: row.get(2)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn index_len(conn: &Connection, index: &str) -> StoreResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM idx WHERE name = ?1", params![index], |row| {
        row.get(0)
    })?;
    Ok(count as usize)
}

fn bump_counter(conn: &Connection, name: &str) -> rusqlite::Result<u64> {
    let value: i64 = conn.query_row(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}
