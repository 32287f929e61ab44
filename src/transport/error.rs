//! Transport error types

use std::time::Duration;
use thiserror::Error;

/// How a connect or send attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Timeouts, network errors, provider hiccups; worth retrying
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Bad target, banned identity, oversized payload; never retried
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Provider flood control
    #[error("Rate limited, cool-down {cooldown:?}")]
    RateLimited { cooldown: Duration },
}

impl SendError {
    /// Check if the attempt may be repeated later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Permanent(_))
    }

    /// Get the cool-down if this is a rate limit error
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            SendError::RateLimited { cooldown } => Some(*cooldown),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        // Anything that didn't produce an HTTP status is a delivery hiccup
        SendError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(SendError::Transient("timeout".into()).is_retryable());
        assert!(
            SendError::RateLimited {
                cooldown: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!SendError::Permanent("chat not found".into()).is_retryable());
    }

    #[test]
    fn test_cooldown() {
        let err = SendError::RateLimited {
            cooldown: Duration::from_secs(30),
        };
        assert_eq!(err.cooldown(), Some(Duration::from_secs(30)));
        assert_eq!(SendError::Transient("x".into()).cooldown(), None);
    }
}
