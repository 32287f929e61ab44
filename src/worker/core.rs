//! MessageWorker - per-identity dispatch task
//!
//! One worker runs per leased identity. It owns the identity's transport
//! session and sends one message at a time:
//! Idle → Fetching → Sending → Recording → Idle, with Backoff after a
//! denied token or a store failure, and Terminated on any exit. Messages to
//! a target that is cooling down are deferred, not sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use super::backoff;
use super::state::{WorkerExit, WorkerSignal, WorkerState};
use crate::clock::Clock;
use crate::control::IdentityControl;
use crate::cooldown::TargetCooldown;
use crate::domain::{IdentityConfig, Message, MessageStatus};
use crate::error::{DispatchError, DispatchResult};
use crate::lease::LeaseManager;
use crate::limiter::RateLimiter;
use crate::pool::{MessagePool, Transition};
use crate::recovery;
use crate::transport::TransportClient;

/// Timing knobs for a worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle re-check period when no wake arrives
    pub poll_interval: Duration,
    /// Wait after the rate limiter denied a token
    pub rate_limit_backoff: Duration,
    /// First delay after a store failure; doubles per consecutive failure
    pub store_retry_base_ms: u64,
    pub store_retry_cap_ms: u64,
    /// Transient connect failures tolerated before giving up the lease
    pub max_connect_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            rate_limit_backoff: Duration::from_millis(250),
            store_retry_base_ms: 100,
            store_retry_cap_ms: 5_000,
            max_connect_attempts: 5,
        }
    }
}

/// Collaborators shared by every worker of an engine
#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: MessagePool,
    pub limiter: RateLimiter,
    pub cooldowns: TargetCooldown,
    pub leases: LeaseManager,
    pub control: IdentityControl,
    pub transport: Arc<dyn TransportClient>,
    pub clock: Arc<dyn Clock>,
}

/// Engine-side end of a worker's control link
#[derive(Debug, Clone)]
pub struct WorkerControl {
    signal_tx: watch::Sender<WorkerSignal>,
    wake: Arc<Notify>,
    lease_expires_at: Arc<AtomicI64>,
}

/// Worker-side end of the control link
#[derive(Debug)]
pub struct WorkerLink {
    signal_rx: watch::Receiver<WorkerSignal>,
    wake: Arc<Notify>,
    lease_expires_at: Arc<AtomicI64>,
}

/// Create a control link for a worker whose lease runs until `lease_expires_at`
pub fn link(wake: Arc<Notify>, lease_expires_at: i64) -> (WorkerControl, WorkerLink) {
    let (signal_tx, signal_rx) = watch::channel(WorkerSignal::Run);
    let expires = Arc::new(AtomicI64::new(lease_expires_at));
    (
        WorkerControl {
            signal_tx,
            wake: wake.clone(),
            lease_expires_at: expires.clone(),
        },
        WorkerLink {
            signal_rx,
            wake,
            lease_expires_at: expires,
        },
    )
}

impl WorkerControl {
    /// Ask the worker to exit; the first exit signal wins
    pub fn signal(&self, signal: WorkerSignal) {
        self.signal_tx.send_if_modified(|current| {
            if *current == WorkerSignal::Run && signal != WorkerSignal::Run {
                *current = signal;
                true
            } else {
                false
            }
        });
    }

    pub fn current_signal(&self) -> WorkerSignal {
        *self.signal_tx.borrow()
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Publish a renewed lease expiry
    pub fn extend_lease(&self, expires_at: i64) {
        self.lease_expires_at.store(expires_at, Ordering::SeqCst);
    }

    /// The lease is gone: no further sends, exit at the next boundary
    pub fn revoke_lease(&self) {
        self.lease_expires_at.store(i64::MIN, Ordering::SeqCst);
        self.signal(WorkerSignal::LeaseLost);
    }
}

/// Result of one pass through Fetching/Sending/Recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A message reached a new state; fetch again right away
    Progress,
    /// Nothing due (or paused)
    Idle,
    /// Wait before fetching again
    Backoff(Duration),
    Exit(WorkerExit),
}

/// Per-identity worker
pub struct MessageWorker {
    identity: IdentityConfig,
    holder: String,
    config: WorkerConfig,
    deps: WorkerDeps,
    link: WorkerLink,
    state: WorkerState,
    consecutive_failures: u32,
    store_failures: u32,
}

impl MessageWorker {
    pub fn new(identity: IdentityConfig, holder: String, config: WorkerConfig, deps: WorkerDeps, link: WorkerLink) -> Self {
        Self {
            identity,
            holder,
            config,
            deps,
            link,
            state: WorkerState::Idle,
            consecutive_failures: 0,
            store_failures: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn identity_id(&self) -> &str {
        &self.identity.identity_id
    }

    fn now(&self) -> i64 {
        self.deps.clock.now_ms()
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(identity_id = %self.identity.identity_id, from = %self.state, to = %state, "worker state");
            self.state = state;
        }
    }

    /// Run until drained, stopped, or the lease is lost
    pub async fn run(mut self) -> WorkerExit {
        info!(identity_id = %self.identity_id(), holder = %self.holder, "Worker starting");

        let exit = match self.start().await {
            Ok(()) => self.dispatch_loop().await,
            Err(exit) => exit,
        };

        self.terminate(&exit).await;
        exit
    }

    async fn start(&mut self) -> Result<(), WorkerExit> {
        loop {
            match self.ensure_lease().await {
                Ok(()) => break,
                Err(DispatchError::LeaseLost { .. }) => return Err(WorkerExit::LeaseLost),
                Err(e) => {
                    let delay = self.store_backoff();
                    warn!(identity_id = %self.identity_id(), error = %e, ?delay, "Lease check failed at start");
                    if let Some(exit) = self.wait(delay).await {
                        return Err(exit);
                    }
                }
            }
        }
        self.store_failures = 0;

        match recovery::reclaim_orphans(&self.deps.pool, &self.identity.identity_id, self.now()).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(identity_id = %self.identity_id(), count = reclaimed.len(), "Reclaimed orphaned messages");
            }
            Ok(_) => {}
            Err(e) => warn!(identity_id = %self.identity_id(), error = %e, "Orphan reclaim failed"),
        }

        self.connect().await?;

        if let Err(e) = self.deps.control.set_online(&self.identity.identity_id, true).await {
            warn!(identity_id = %self.identity_id(), error = %e, "Failed to mark identity online");
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), WorkerExit> {
        let mut attempt = 0;
        loop {
            let error = match self.deps.transport.connect(&self.identity.identity_id).await {
                Ok(()) => {
                    info!(identity_id = %self.identity_id(), "Transport connected");
                    return Ok(());
                }
                Err(e) => e,
            };

            attempt += 1;
            let give_up = !error.is_retryable() || attempt >= self.config.max_connect_attempts;
            if give_up {
                error!(identity_id = %self.identity_id(), error = %error, attempt, "Transport connect failed");
                let reason = format!("connect failed: {}", error);
                if let Err(e) = self
                    .deps
                    .control
                    .record_error(&self.identity.identity_id, &reason, self.now())
                    .await
                {
                    warn!(identity_id = %self.identity_id(), error = %e, "Failed to record connect error");
                }
                return Err(WorkerExit::ConnectFailed(error.to_string()));
            }

            let delay = error.cooldown().unwrap_or_else(|| {
                Duration::from_millis(backoff::exponential(
                    attempt,
                    self.config.store_retry_base_ms,
                    self.config.store_retry_cap_ms,
                ))
            });
            warn!(identity_id = %self.identity_id(), error = %error, attempt, ?delay, "Transport connect failed, retrying");
            self.set_state(WorkerState::Backoff);
            if let Some(exit) = self.wait(delay).await {
                return Err(exit);
            }
        }
    }

    async fn dispatch_loop(&mut self) -> WorkerExit {
        loop {
            if let Some(exit) = self.pending_exit() {
                return exit;
            }

            match self.run_once().await {
                StepOutcome::Progress => {}
                StepOutcome::Idle => {
                    self.set_state(WorkerState::Idle);
                    if let Some(exit) = self.idle().await {
                        return exit;
                    }
                }
                StepOutcome::Backoff(delay) => {
                    self.set_state(WorkerState::Backoff);
                    if let Some(exit) = self.wait(delay).await {
                        return exit;
                    }
                }
                StepOutcome::Exit(exit) => return exit,
            }
        }
    }

    /// One Fetching → Sending → Recording pass; store errors become a backoff
    pub async fn run_once(&mut self) -> StepOutcome {
        self.set_state(WorkerState::Fetching);
        match self.step().await {
            Ok(outcome) => {
                self.store_failures = 0;
                outcome
            }
            Err(DispatchError::LeaseLost { identity_id }) => {
                warn!(%identity_id, "Lease no longer held, stopping before send");
                StepOutcome::Exit(WorkerExit::LeaseLost)
            }
            Err(e) => {
                let delay = self.store_backoff();
                if e.is_recoverable() {
                    warn!(identity_id = %self.identity_id(), error = %e, ?delay, "Dispatch step failed");
                } else {
                    error!(identity_id = %self.identity_id(), error = %e, ?delay, "Dispatch step failed");
                }
                StepOutcome::Backoff(delay)
            }
        }
    }

    async fn step(&mut self) -> DispatchResult<StepOutcome> {
        let identity_id = self.identity.identity_id.clone();
        let now = self.now();

        if self.deps.control.get(&identity_id).await?.paused {
            debug!(%identity_id, "step: identity paused");
            return Ok(StepOutcome::Idle);
        }

        let Some(message) = self.deps.pool.peek_due(&identity_id, now).await? else {
            return Ok(StepOutcome::Idle);
        };

        if message.is_expired(now) {
            self.expire(&message, now).await?;
            return Ok(StepOutcome::Progress);
        }

        // A deposed worker must not defer or spend for the new holder
        self.ensure_lease().await?;

        if let Some(free_at) = self
            .deps
            .cooldowns
            .check(&self.identity, &message.target, now)
            .await?
        {
            debug!(id = %message.id, target = %message.target, free_at, "step: target cooling down, deferring");
            self.deps.pool.requeue(&message.id, free_at, now).await?;
            return Ok(StepOutcome::Progress);
        }

        if !self.deps.limiter.try_consume(&self.identity, now).await? {
            return Ok(StepOutcome::Backoff(self.config.rate_limit_backoff));
        }

        let claimed = self
            .deps
            .pool
            .transition(&message.id, |m| {
                if !m.status.is_dispatchable() {
                    return false;
                }
                m.set_status(MessageStatus::Leased, now);
                true
            })
            .await?;
        let message = match claimed {
            Transition::Applied(message) => message,
            Transition::Refused(current) => {
                debug!(id = %current.id, status = %current.status, "step: claim refused");
                return Ok(StepOutcome::Progress);
            }
        };

        self.set_state(WorkerState::Sending);
        debug!(id = %message.id, %identity_id, attempt = message.attempt_count + 1, "step: sending");
        let result = self
            .deps
            .transport
            .send(&identity_id, &message.target, &message.payload)
            .await
            .map_err(DispatchError::from);

        self.set_state(WorkerState::Recording);
        Ok(self.record(&message, result).await)
    }

    async fn expire(&self, message: &Message, now: i64) -> DispatchResult<()> {
        let outcome = self
            .deps
            .pool
            .transition(&message.id, |m| {
                m.set_error("expired", now);
                m.set_status(MessageStatus::Cancelled, now);
                true
            })
            .await?;
        if let Transition::Applied(_) = outcome {
            self.deps.pool.remove(&message.id).await?;
            info!(id = %message.id, identity_id = %message.identity_id, "Message expired before dispatch");
        }
        Ok(())
    }

    /// Record a send outcome, retrying store failures while the lease holds
    async fn record(&mut self, message: &Message, result: DispatchResult<()>) -> StepOutcome {
        let mut failures = 0;
        loop {
            match self.record_once(message, &result).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    failures += 1;
                    if !self.lease_locally_valid() {
                        error!(id = %message.id, error = %e, "Could not record outcome before lease expired");
                        return StepOutcome::Exit(WorkerExit::LeaseLost);
                    }
                    let delay = Duration::from_millis(backoff::exponential(
                        failures,
                        self.config.store_retry_base_ms,
                        self.config.store_retry_cap_ms,
                    ));
                    warn!(id = %message.id, error = %e, ?delay, "Recording outcome failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn record_once(&mut self, message: &Message, result: &DispatchResult<()>) -> DispatchResult<StepOutcome> {
        let identity_id = &self.identity.identity_id;
        let now = self.now();

        match result {
            Ok(()) => {
                self.deps
                    .pool
                    .transition(&message.id, |m| {
                        m.set_status(MessageStatus::Sent, now);
                        true
                    })
                    .await?;
                self.deps.pool.remove(&message.id).await?;
                self.deps.cooldowns.record(&self.identity, &message.target, now).await?;
                self.deps.control.record_sent(identity_id).await?;
                self.consecutive_failures = 0;
                info!(id = %message.id, %identity_id, target = %message.target, "Message sent");
                self.schedule_next(message, now).await?;
                Ok(StepOutcome::Progress)
            }
            Err(failure @ DispatchError::PermanentDelivery(reason)) => {
                self.consecutive_failures += 1;
                self.deps
                    .pool
                    .transition(&message.id, |m| {
                        m.set_error(reason.as_str(), now);
                        m.set_status(MessageStatus::DeadLettered, now);
                        true
                    })
                    .await?;
                self.deps.pool.remove(&message.id).await?;
                let surfaced = format!("message {} dead-lettered: {}", message.id, failure);
                self.deps.control.record_error(identity_id, &surfaced, now).await?;
                error!(id = %message.id, %identity_id, %reason, "Message dead-lettered");
                Ok(StepOutcome::Progress)
            }
            Err(DispatchError::RateLimited { cooldown }) => {
                self.deps.limiter.force_drain(&self.identity, now, *cooldown).await?;
                self.deps
                    .pool
                    .transition(&message.id, |m| {
                        if m.status != MessageStatus::Leased {
                            return false;
                        }
                        m.set_status(MessageStatus::Pending, now);
                        true
                    })
                    .await?;
                warn!(id = %message.id, %identity_id, ?cooldown, "Provider rate limit, bucket drained");
                Ok(StepOutcome::Backoff(self.config.rate_limit_backoff))
            }
            Err(failure) => {
                let reason = match failure {
                    DispatchError::TransientDelivery(reason) => reason.clone(),
                    other => other.to_string(),
                };
                self.consecutive_failures += 1;
                let attempts = message.attempt_count + 1;
                if attempts < self.identity.max_attempts {
                    let delay = backoff::retry_delay(attempts, self.identity.backoff_base_ms, self.identity.backoff_cap_ms);
                    let next_retry_at = now + delay as i64;
                    self.deps
                        .pool
                        .record_retry(&message.id, &reason, next_retry_at, now)
                        .await?;
                    warn!(id = %message.id, %identity_id, attempts, next_retry_at, %reason, "Send failed, retry scheduled");
                } else {
                    self.deps
                        .pool
                        .transition(&message.id, |m| {
                            m.attempt_count = attempts;
                            m.set_error(reason.as_str(), now);
                            m.set_status(MessageStatus::Failed, now);
                            true
                        })
                        .await?;
                    self.deps.pool.remove(&message.id).await?;
                    let surfaced = format!("message {} failed after {} attempts: {}", message.id, attempts, failure);
                    self.deps.control.record_error(identity_id, &surfaced, now).await?;
                    error!(id = %message.id, %identity_id, attempts, %reason, "Retries exhausted");
                    self.schedule_next(message, now).await?;
                }
                Ok(StepOutcome::Progress)
            }
        }
    }

    /// Enqueue the following occurrence of a recurring message
    async fn schedule_next(&self, message: &Message, now: i64) -> DispatchResult<()> {
        if let Some(outcome) = self.deps.pool.schedule_next(message, now).await?
            && !outcome.is_duplicate()
        {
            let next = outcome.message();
            info!(id = %next.id, identity_id = %next.identity_id, scheduled_at = next.scheduled_at, "Next occurrence scheduled");
        }
        Ok(())
    }

    fn lease_locally_valid(&self) -> bool {
        self.now() < self.link.lease_expires_at.load(Ordering::SeqCst)
    }

    /// Local expiry first, then the store record
    async fn ensure_lease(&self) -> DispatchResult<()> {
        let held = self.lease_locally_valid()
            && self
                .deps
                .leases
                .verify(&self.identity.identity_id, &self.holder, self.now())
                .await?;
        if held {
            Ok(())
        } else {
            Err(DispatchError::LeaseLost {
                identity_id: self.identity.identity_id.clone(),
            })
        }
    }

    fn store_backoff(&mut self) -> Duration {
        self.store_failures += 1;
        Duration::from_millis(backoff::exponential(
            self.store_failures,
            self.config.store_retry_base_ms,
            self.config.store_retry_cap_ms,
        ))
    }

    fn pending_exit(&mut self) -> Option<WorkerExit> {
        if self.link.signal_rx.has_changed().is_err() {
            // Engine dropped the link
            return Some(WorkerExit::Stopped);
        }
        self.link.signal_rx.borrow_and_update().exit()
    }

    /// Sleep, cut short by an exit signal
    async fn wait(&mut self, delay: Duration) -> Option<WorkerExit> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            changed = self.link.signal_rx.changed() => match changed {
                Ok(()) => self.link.signal_rx.borrow_and_update().exit(),
                Err(_) => Some(WorkerExit::Stopped),
            },
        }
    }

    /// Sleep until the poll interval elapses, a wake arrives, or a signal
    async fn idle(&mut self) -> Option<WorkerExit> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => None,
            _ = self.link.wake.notified() => None,
            changed = self.link.signal_rx.changed() => match changed {
                Ok(()) => self.link.signal_rx.borrow_and_update().exit(),
                Err(_) => Some(WorkerExit::Stopped),
            },
        }
    }

    async fn terminate(&mut self, exit: &WorkerExit) {
        self.set_state(WorkerState::Terminated);
        self.deps.transport.disconnect(&self.identity.identity_id).await;

        // After a lease loss the new holder owns the online flag
        if *exit != WorkerExit::LeaseLost
            && let Err(e) = self.deps.control.set_online(&self.identity.identity_id, false).await
        {
            warn!(identity_id = %self.identity_id(), error = %e, "Failed to mark identity offline");
        }

        info!(identity_id = %self.identity_id(), %exit, consecutive_failures = self.consecutive_failures, "Worker terminated");
    }
}
