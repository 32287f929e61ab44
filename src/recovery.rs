//! Crash recovery
//!
//! A process that dies mid-send leaves its message `Leased`. Nothing else can
//! touch that message until the dead holder's lease expires; the next lease
//! holder then resets it to `Pending` with its attempt count intact.

use tracing::{debug, info, warn};

use crate::domain::{MessageStatus, Message};
use crate::error::DispatchResult;
use crate::pool::{MessagePool, Transition};

/// Recovery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Identities scanned
    pub identities: usize,
    /// Messages still pending
    pub pending: usize,
    /// Messages left `Leased` by a previous holder
    pub orphaned: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "identities: {}, pending: {}, orphaned: {}",
            self.identities, self.pending, self.orphaned
        )
    }
}

/// Count in-flight work left behind by earlier runs
///
/// Read-only: orphans are reclaimed by whichever process next holds the
/// identity's lease.
pub async fn scan_for_recovery(pool: &MessagePool, identity_ids: &[String]) -> DispatchResult<RecoveryStats> {
    let mut stats = RecoveryStats {
        identities: identity_ids.len(),
        ..RecoveryStats::default()
    };

    for identity_id in identity_ids {
        let active = pool.active(identity_id, usize::MAX).await?;
        for message in &active {
            match message.status {
                MessageStatus::Leased => {
                    debug!(id = %message.id, %identity_id, attempt_count = message.attempt_count, "Found orphaned message");
                    stats.orphaned += 1;
                }
                MessageStatus::Pending => stats.pending += 1,
                _ => {}
            }
        }
    }

    if stats.orphaned > 0 {
        info!("Recovery scan found in-flight work: {}", stats);
    } else {
        debug!("Recovery scan found no in-flight work");
    }
    Ok(stats)
}

/// Reset the identity's `Leased` messages to `Pending`
///
/// Only the current lease holder may call this.
pub async fn reclaim_orphans(pool: &MessagePool, identity_id: &str, now: i64) -> DispatchResult<Vec<Message>> {
    debug!(%identity_id, "reclaim_orphans: called");
    let mut reclaimed = Vec::new();

    for message in pool.active(identity_id, usize::MAX).await? {
        if message.status != MessageStatus::Leased {
            continue;
        }
        let outcome = pool
            .transition(&message.id, |m| {
                if m.status != MessageStatus::Leased {
                    return false;
                }
                m.set_status(MessageStatus::Pending, now);
                true
            })
            .await?;
        if let Transition::Applied(message) = outcome {
            warn!(id = %message.id, %identity_id, attempt_count = message.attempt_count, "Reclaimed orphaned message");
            reclaimed.push(message);
        }
    }

    Ok(reclaimed)
}
