//! Scripted transport
//!
//! Replays queued outcomes per identity and records every delivery. With an
//! empty script every send succeeds, which is what `run --dry-run` uses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{SendError, TransportClient};

/// One successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub identity_id: String,
    pub target: String,
    pub payload: String,
}

#[derive(Debug, Default)]
struct ScriptState {
    send_outcomes: HashMap<String, VecDeque<Result<(), SendError>>>,
    connect_outcomes: HashMap<String, VecDeque<Result<(), SendError>>>,
    delivered: Vec<Delivery>,
    attempts: HashMap<String, usize>,
    connected: HashSet<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every send for `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue the outcome of the identity's next unscripted send
    pub fn push_send(&self, identity_id: &str, outcome: Result<(), SendError>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .send_outcomes
                .entry(identity_id.to_string())
                .or_default()
                .push_back(outcome);
        }
    }

    /// Queue the outcome of the identity's next connect
    pub fn push_connect(&self, identity_id: &str, outcome: Result<(), SendError>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .connect_outcomes
                .entry(identity_id.to_string())
                .or_default()
                .push_back(outcome);
        }
    }

    /// Successful sends, in order
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().map(|s| s.delivered.clone()).unwrap_or_default()
    }

    /// Send attempts (successful or not) for an identity
    pub fn attempts(&self, identity_id: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.attempts.get(identity_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_connected(&self, identity_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.connected.contains(identity_id))
            .unwrap_or(false)
    }

    /// Highest number of concurrent sends seen for any single identity
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().map(|s| s.max_in_flight).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ScriptState>, SendError> {
        self.state
            .lock()
            .map_err(|_| SendError::Transient("scripted transport poisoned".to_string()))
    }
}

#[async_trait]
impl TransportClient for ScriptedTransport {
    async fn connect(&self, identity_id: &str) -> Result<(), SendError> {
        debug!(%identity_id, "ScriptedTransport::connect: called");
        let mut state = self.lock()?;
        let outcome = state
            .connect_outcomes
            .get_mut(identity_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            state.connected.insert(identity_id.to_string());
        }
        outcome
    }

    async fn send(&self, identity_id: &str, target: &str, payload: &str) -> Result<(), SendError> {
        debug!(%identity_id, %target, "ScriptedTransport::send: called");
        {
            let mut state = self.lock()?;
            *state.attempts.entry(identity_id.to_string()).or_default() += 1;
            let in_flight = state.in_flight.entry(identity_id.to_string()).or_default();
            *in_flight += 1;
            let current = *in_flight;
            state.max_in_flight = state.max_in_flight.max(current);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.lock()?;
        if let Some(in_flight) = state.in_flight.get_mut(identity_id) {
            *in_flight = in_flight.saturating_sub(1);
        }
        let outcome = state
            .send_outcomes
            .get_mut(identity_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()));

        if outcome.is_ok() {
            info!(%identity_id, %target, payload_len = payload.len(), "Delivered (scripted)");
            state.delivered.push(Delivery {
                identity_id: identity_id.to_string(),
                target: target.to_string(),
                payload: payload.to_string(),
            });
        }
        outcome
    }

    async fn disconnect(&self, identity_id: &str) {
        debug!(%identity_id, "ScriptedTransport::disconnect: called");
        if let Ok(mut state) = self.state.lock() {
            state.connected.remove(identity_id);
        }
    }
}
