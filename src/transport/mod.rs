//! Transport client capability
//!
//! The scheduler talks to the chat provider only through [`TransportClient`].

use std::sync::Arc;

use tracing::debug;

mod client;
mod error;
mod scripted;
mod webhook;

pub use client::TransportClient;
pub use error::SendError;
pub use scripted::{Delivery, ScriptedTransport};
pub use webhook::WebhookTransport;

use crate::config::{TransportConfig, TransportKind};

/// Create a transport based on the kind specified in config
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn TransportClient>, SendError> {
    debug!(kind = ?config.kind, base_url = %config.base_url, "create_transport: called");
    match config.kind {
        TransportKind::Webhook => Ok(Arc::new(WebhookTransport::from_config(config)?)),
        TransportKind::DryRun => Ok(Arc::new(ScriptedTransport::new())),
    }
}
