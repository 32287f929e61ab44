//! Transport client trait

use async_trait::async_trait;

use super::SendError;

/// Session with the chat provider on behalf of bot identities
///
/// The worker calls `connect` once per lease, then `send` for each message
/// with exactly one send in flight per identity, then `disconnect`.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open (or validate) the identity's session
    async fn connect(&self, identity_id: &str) -> Result<(), SendError>;

    /// Deliver one message
    async fn send(&self, identity_id: &str, target: &str, payload: &str) -> Result<(), SendError>;

    /// Close the identity's session; failures are not reported
    async fn disconnect(&self, identity_id: &str);
}
