//! SqliteStore actor messages

use tokio::sync::oneshot;

use super::{CasOutcome, IndexEntry, StoreResult, Versioned};

/// Commands sent to the SqliteStore actor
#[derive(Debug)]
pub enum StoreCommand {
    Get {
        key: String,
        reply: oneshot::Sender<StoreResult<Option<Versioned>>>,
    },
    CasWrite {
        key: String,
        expected: Option<u64>,
        new: Option<String>,
        reply: oneshot::Sender<StoreResult<CasOutcome>>,
    },

    // Ordered index operations
    IndexPut {
        index: String,
        entry: IndexEntry,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    IndexRemove {
        index: String,
        member: String,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    OrderedRead {
        index: String,
        up_to: i64,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<IndexEntry>>>,
    },
    IndexLen {
        index: String,
        reply: oneshot::Sender<StoreResult<usize>>,
    },

    NextSeq {
        counter: String,
        reply: oneshot::Sender<StoreResult<u64>>,
    },

    /// Stop the actor and close the connection
    Shutdown { reply: oneshot::Sender<()> },
}
