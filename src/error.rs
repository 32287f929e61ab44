//! Dispatch error taxonomy

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;
use crate::transport::SendError;

/// Errors surfaced across the dispatch core
///
/// A duplicate enqueue is not an error: it is reported as
/// [`EnqueueOutcome::Duplicate`](crate::pool::EnqueueOutcome::Duplicate).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Transient delivery error: {0}")]
    TransientDelivery(String),

    #[error("Permanent delivery error: {0}")]
    PermanentDelivery(String),

    #[error("Rate limited by provider, cool-down {cooldown:?}")]
    RateLimited { cooldown: Duration },

    #[error("Lease lost for identity {identity_id}")]
    LeaseLost { identity_id: String },

    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result of dispatch-core operations
pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    /// Errors that the worker or engine absorb and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransientDelivery(_)
                | Self::RateLimited { .. }
                | Self::LeaseLost { .. }
                | Self::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<SendError> for DispatchError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Transient(reason) => Self::TransientDelivery(reason),
            SendError::Permanent(reason) => Self::PermanentDelivery(reason),
            SendError::RateLimited { cooldown } => Self::RateLimited { cooldown },
        }
    }
}
