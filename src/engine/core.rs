//! SchedulerEngine - lease holder and worker supervisor
//!
//! Each tick the engine:
//! - reaps finished workers (releasing their leases)
//! - acquires or renews the lease of every registered identity
//! - spawns a worker for each leased identity without one
//! - tells workers of paused or lost identities to step down
//! - every `cleanup_every_ticks` ticks, purges expired terminal messages

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::EngineConfig;
use super::wakers::Wakers;
use crate::clock::Clock;
use crate::control::IdentityControl;
use crate::cooldown::TargetCooldown;
use crate::domain::{IdentityConfig, generate_holder_token};
use crate::error::{DispatchError, DispatchResult};
use crate::lease::{LeaseManager, LeaseOutcome};
use crate::limiter::RateLimiter;
use crate::pool::MessagePool;
use crate::recovery;
use crate::store::StateStore;
use crate::transport::TransportClient;
use crate::worker::{self, MessageWorker, WorkerControl, WorkerDeps, WorkerExit, WorkerSignal, backoff};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub acquired: usize,
    pub renewed: usize,
    /// Leases found held by another process while we ran a worker
    pub lost: usize,
    pub spawned: usize,
    pub reaped: usize,
    /// Paused identities skipped this tick
    pub paused: usize,
    /// Identities whose supervision failed this tick
    pub failed: usize,
}

struct WorkerEntry {
    control: WorkerControl,
    handle: JoinHandle<WorkerExit>,
}

/// Scheduler engine
pub struct SchedulerEngine {
    config: EngineConfig,
    identities: BTreeMap<String, IdentityConfig>,
    holder: String,
    deps: WorkerDeps,
    wakers: Wakers,
    workers: HashMap<String, WorkerEntry>,
    /// Identities whose transport failed to connect, with the time they may
    /// be leased again
    connect_cooldowns: HashMap<String, i64>,
    ticks: u64,
}

impl SchedulerEngine {
    /// Create an engine for a fixed identity set
    pub fn new(
        config: EngineConfig,
        identities: Vec<IdentityConfig>,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn TransportClient>,
        clock: Arc<dyn Clock>,
    ) -> DispatchResult<Self> {
        config.validate()?;

        let deps = WorkerDeps {
            pool: MessagePool::new(store.clone()),
            limiter: RateLimiter::new(store.clone()),
            cooldowns: TargetCooldown::new(store.clone()),
            leases: LeaseManager::new(store.clone()),
            control: IdentityControl::new(store),
            transport,
            clock,
        };

        let mut engine = Self {
            config,
            identities: BTreeMap::new(),
            holder: generate_holder_token(),
            deps,
            wakers: Wakers::new(),
            workers: HashMap::new(),
            connect_cooldowns: HashMap::new(),
            ticks: 0,
        };
        for identity in identities {
            engine.add_identity(identity)?;
        }

        info!(holder = %engine.holder, identities = engine.identities.len(), "SchedulerEngine created");
        Ok(engine)
    }

    /// Register an identity; picked up on the next tick
    pub fn add_identity(&mut self, identity: IdentityConfig) -> DispatchResult<()> {
        identity.validate()?;
        if self.identities.contains_key(&identity.identity_id) {
            return Err(DispatchError::InvalidConfig(format!(
                "identity '{}' registered twice",
                identity.identity_id
            )));
        }
        debug!(identity_id = %identity.identity_id, "add_identity: registered");
        self.identities.insert(identity.identity_id.clone(), identity);
        Ok(())
    }

    /// This process's lease holder token
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Wake handles for producers in this process
    pub fn wakers(&self) -> Wakers {
        self.wakers.clone()
    }

    pub fn pool(&self) -> &MessagePool {
        &self.deps.pool
    }

    pub fn identity_ids(&self) -> Vec<String> {
        self.identities.keys().cloned().collect()
    }

    /// Get the number of running workers
    pub fn running_count(&self) -> usize {
        self.workers.len()
    }

    /// Get identities with a running worker
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run until `shutdown_rx` fires (or its sender is dropped), then drain
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(holder = %self.holder, "SchedulerEngine starting");

        match recovery::scan_for_recovery(&self.deps.pool, &self.identity_ids()).await {
            Ok(stats) => debug!(%stats, "Recovery scan complete"),
            Err(e) => warn!(error = %e, "Recovery scan failed"),
        }

        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) => {
                            failures = 0;
                            debug!(?report, "tick complete");
                        }
                        Err(e) => {
                            failures += 1;
                            let delay = Duration::from_millis(backoff::exponential(
                                failures,
                                self.config.store_retry_base_ms,
                                self.config.store_retry_cap_ms,
                            ));
                            if e.is_recoverable() {
                                warn!(error = %e, failures, ?delay, "Store unavailable, backing off");
                            } else {
                                error!(error = %e, failures, ?delay, "Tick failed, backing off");
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown_rx.recv() => {
                                    info!("Shutdown signal received");
                                    break;
                                }
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One supervision pass
    pub async fn tick(&mut self) -> DispatchResult<TickReport> {
        let mut report = TickReport {
            reaped: self.reap_finished().await,
            ..TickReport::default()
        };

        let identities: Vec<IdentityConfig> = self.identities.values().cloned().collect();
        for identity in identities {
            match self.supervise(&identity, &mut report).await {
                Ok(()) => {}
                // Nothing else can make progress either
                Err(e @ DispatchError::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    warn!(identity_id = %identity.identity_id, error = %e, "Supervision failed, skipping identity");
                    let reason = format!("supervision failed: {}", e);
                    if let Err(record_err) = self
                        .deps
                        .control
                        .record_error(&identity.identity_id, &reason, self.deps.clock.now_ms())
                        .await
                    {
                        warn!(identity_id = %identity.identity_id, error = %record_err, "Failed to record supervision error");
                    }
                }
            }
        }

        self.ticks += 1;
        if self.ticks % self.config.cleanup_every_ticks == 0 {
            match self.cleanup().await {
                Ok(purged) => debug!(purged, "tick: cleanup complete"),
                Err(e) => warn!(error = %e, "Cleanup failed"),
            }
        }

        Ok(report)
    }

    async fn supervise(&mut self, identity: &IdentityConfig, report: &mut TickReport) -> DispatchResult<()> {
        let identity_id = identity.identity_id.as_str();
        let now = self.deps.clock.now_ms();

        if self.deps.control.get(identity_id).await?.paused {
            report.paused += 1;
            match self.workers.get(identity_id) {
                // Lease is released once the worker confirms
                Some(entry) => entry.control.signal(WorkerSignal::Stop),
                None => {
                    self.deps.leases.release(identity_id, &self.holder).await?;
                }
            }
            return Ok(());
        }

        if let Some(entry) = self.workers.get(identity_id)
            && entry.control.current_signal() != WorkerSignal::Run
        {
            debug!(%identity_id, "supervise: worker stepping down, waiting for it");
            return Ok(());
        }

        if let Some(&until) = self.connect_cooldowns.get(identity_id) {
            if now < until {
                return Ok(());
            }
            self.connect_cooldowns.remove(identity_id);
        }

        match self
            .deps
            .leases
            .acquire(identity_id, &self.holder, now, self.config.lease_ttl())
            .await?
        {
            LeaseOutcome::Acquired(lease) => {
                report.acquired += 1;
                self.ensure_worker(identity, lease.expires_at, report).await;
            }
            LeaseOutcome::Renewed(lease) => {
                report.renewed += 1;
                self.ensure_worker(identity, lease.expires_at, report).await;
            }
            LeaseOutcome::Held { holder, expires_at } => {
                if let Some(entry) = self.workers.get(identity_id) {
                    warn!(%identity_id, %holder, expires_at, "Lease taken by another holder, stopping worker");
                    entry.control.revoke_lease();
                    report.lost += 1;
                }
            }
        }
        Ok(())
    }

    async fn ensure_worker(&mut self, identity: &IdentityConfig, expires_at: i64, report: &mut TickReport) {
        if let Some(entry) = self.workers.get(&identity.identity_id) {
            entry.control.extend_lease(expires_at);
            return;
        }
        self.spawn_worker(identity, expires_at).await;
        report.spawned += 1;
    }

    async fn spawn_worker(&mut self, identity: &IdentityConfig, expires_at: i64) {
        let wake = self.wakers.get_or_create(&identity.identity_id).await;
        let (control, link) = worker::link(wake, expires_at);
        let worker = MessageWorker::new(
            identity.clone(),
            self.holder.clone(),
            self.config.worker_config(),
            self.deps.clone(),
            link,
        );

        let handle = tokio::spawn(worker.run());
        self.workers
            .insert(identity.identity_id.clone(), WorkerEntry { control, handle });
        info!(identity_id = %identity.identity_id, expires_at, "Spawned worker");
    }

    /// Collect finished workers; returns how many were reaped
    async fn reap_finished(&mut self) -> usize {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for identity_id in &finished {
            let Some(entry) = self.workers.remove(identity_id) else {
                continue;
            };
            let exit = match entry.handle.await {
                Ok(exit) => {
                    info!(%identity_id, %exit, "Worker finished");
                    Some(exit)
                }
                Err(e) => {
                    error!(%identity_id, error = %e, "Worker task panicked");
                    None
                }
            };
            self.after_exit(identity_id, exit).await;
        }

        finished.len()
    }

    async fn after_exit(&mut self, identity_id: &str, exit: Option<WorkerExit>) {
        if let Some(WorkerExit::ConnectFailed(_)) = &exit {
            let until = self.deps.clock.now_ms() + self.config.connect_cooldown_ms as i64;
            self.connect_cooldowns.insert(identity_id.to_string(), until);
        }
        if exit == Some(WorkerExit::LeaseLost) {
            return;
        }
        if let Err(e) = self.deps.leases.release(identity_id, &self.holder).await {
            warn!(%identity_id, error = %e, "Failed to release lease; it will expire");
        }
    }

    /// Purge terminal messages past retention for every identity
    pub async fn cleanup(&self) -> DispatchResult<usize> {
        let cutoff = self.deps.clock.now_ms() - self.config.retention_ms as i64;
        let mut purged = 0;
        for identity_id in self.identities.keys() {
            purged += self.deps.pool.purge_terminal(identity_id, cutoff).await?;
        }
        if purged > 0 {
            info!(purged, cutoff, "Retention cleanup purged messages");
        }
        Ok(purged)
    }

    /// Drain every worker, wait up to the shutdown timeout, abort the rest
    pub async fn shutdown(&mut self) {
        info!("Shutting down SchedulerEngine with {} active workers", self.workers.len());

        for entry in self.workers.values() {
            entry.control.signal(WorkerSignal::Drain);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        loop {
            self.reap_finished().await;
            if self.workers.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if !self.workers.is_empty() {
            warn!("Aborting {} workers after timeout; their leases will expire", self.workers.len());
            for (identity_id, entry) in self.workers.drain() {
                debug!(%identity_id, "shutdown: aborting worker");
                entry.handle.abort();
            }
        }

        info!("SchedulerEngine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{MessageStatus, NewMessage};
    use crate::store::{MemoryStore, keys};
    use crate::transport::{ScriptedTransport, SendError};

    fn config() -> EngineConfig {
        EngineConfig {
            tick_interval_ms: 20,
            lease_ttl_ms: 60_000,
            poll_interval_ms: 10,
            rate_limit_backoff_ms: 10,
            store_retry_base_ms: 5,
            store_retry_cap_ms: 20,
            shutdown_timeout_ms: 2_000,
            ..EngineConfig::default()
        }
    }

    fn identity(id: &str) -> IdentityConfig {
        IdentityConfig::new(id, 10, 60_000, 3, 1_000, 60_000)
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        transport: Arc<ScriptedTransport>,
        engine: SchedulerEngine,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(10_000);
        let transport = Arc::new(ScriptedTransport::new());
        let engine = SchedulerEngine::new(
            config(),
            ids.iter().map(|id| identity(id)).collect(),
            store.clone(),
            transport.clone(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Fixture {
            store,
            clock,
            transport,
            engine,
        }
    }

    async fn wait_for_status(pool: &MessagePool, id: &str, status: MessageStatus) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Some(message) = pool.get(id).await.unwrap()
                    && message.status == status
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_invalid_setup() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let transport: Arc<dyn TransportClient> = Arc::new(ScriptedTransport::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));

        let bad = EngineConfig {
            tick_interval_ms: 10_000,
            lease_ttl_ms: 10_000,
            ..EngineConfig::default()
        };
        assert!(SchedulerEngine::new(bad, vec![], store.clone(), transport.clone(), clock.clone()).is_err());

        let dup = vec![identity("bot-a"), identity("bot-a")];
        assert!(SchedulerEngine::new(config(), dup, store, transport, clock).is_err());
    }

    #[tokio::test]
    async fn test_tick_acquires_and_spawns() {
        let mut fx = fixture(&["bot-a", "bot-b"]);

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.acquired, 2);
        assert_eq!(report.spawned, 2);
        assert_eq!(fx.engine.running_ids(), vec!["bot-a", "bot-b"]);

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.renewed, 2);
        assert_eq!(report.spawned, 0);

        fx.engine.shutdown().await;
        assert_eq!(fx.engine.running_count(), 0);
    }

    #[tokio::test]
    async fn test_due_message_sent_after_one_tick() {
        let mut fx = fixture(&["bot-a"]);
        fx.engine
            .pool()
            .enqueue(NewMessage::new("bot-a", "chat-1", "hello", 10_000).with_id("m1"), 10_000)
            .await
            .unwrap();

        fx.engine.tick().await.unwrap();
        wait_for_status(fx.engine.pool(), "m1", MessageStatus::Sent).await;
        assert_eq!(fx.transport.deliveries().len(), 1);
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_stops_worker_and_releases_lease() {
        let mut fx = fixture(&["bot-a"]);
        fx.engine.tick().await.unwrap();
        assert_eq!(fx.engine.running_count(), 1);

        let control = IdentityControl::new(fx.store.clone());
        control.set_paused("bot-a", true).await.unwrap();

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.paused, 1);

        tokio::time::timeout(Duration::from_secs(3), async {
            while fx.engine.running_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                fx.engine.tick().await.unwrap();
            }
        })
        .await
        .unwrap();

        let leases = LeaseManager::new(fx.store.clone());
        assert!(leases.holder("bot-a", fx.clock.now_ms()).await.unwrap().is_none());

        control.set_paused("bot-a", false).await.unwrap();
        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.spawned, 1);
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_is_not_taken() {
        let mut fx = fixture(&["bot-a"]);
        let leases = LeaseManager::new(fx.store.clone());
        leases
            .acquire("bot-a", "other-process", fx.clock.now_ms(), Duration::from_secs(30))
            .await
            .unwrap();

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.acquired, 0);
        assert_eq!(fx.engine.running_count(), 0);

        // Other holder's lease expires
        fx.clock.advance(30_000);
        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.acquired, 1);
        assert_eq!(report.spawned, 1);
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stolen_lease_stops_worker() {
        let mut fx = fixture(&["bot-a"]);
        fx.engine.tick().await.unwrap();

        // Our lease lapses and another process takes over
        fx.clock.advance(61_000);
        let leases = LeaseManager::new(fx.store.clone());
        let outcome = leases
            .acquire("bot-a", "other-process", fx.clock.now_ms(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.is_owned());

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.lost, 1);

        tokio::time::timeout(Duration::from_secs(3), async {
            while fx.engine.running_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                fx.engine.tick().await.unwrap();
            }
        })
        .await
        .unwrap();

        // The other holder keeps its lease
        let holder = leases.holder("bot-a", fx.clock.now_ms()).await.unwrap().unwrap();
        assert_eq!(holder.holder_token, "other-process");
    }

    #[tokio::test]
    async fn test_connect_failure_cools_down() {
        let mut fx = fixture(&["bot-a"]);
        fx.transport
            .push_connect("bot-a", Err(SendError::Permanent("banned".into())));

        fx.engine.tick().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            while fx.engine.running_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                fx.engine.tick().await.unwrap();
            }
        })
        .await
        .unwrap();

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.spawned, 0);

        fx.clock.advance(60_000);
        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.spawned, 1);
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_outage_fails_tick() {
        let mut fx = fixture(&["bot-a"]);
        fx.store.set_available(false);
        let result = fx.engine.tick().await;
        assert!(matches!(result, Err(DispatchError::StoreUnavailable(_))));

        fx.store.set_available(true);
        assert!(fx.engine.tick().await.is_ok());
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_broken_identity_does_not_block_others() {
        let mut fx = fixture(&["bot-a", "bot-b"]);
        fx.engine
            .pool()
            .enqueue(NewMessage::new("bot-b", "chat-1", "hello", 10_000).with_id("m1"), 10_000)
            .await
            .unwrap();
        fx.store
            .cas_write(&keys::identity("bot-a"), None, Some("not json".to_string()))
            .await
            .unwrap();

        let report = fx.engine.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(fx.engine.running_ids(), vec!["bot-b"]);

        wait_for_status(fx.engine.pool(), "m1", MessageStatus::Sent).await;
        assert_eq!(fx.transport.deliveries().len(), 1);
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_terminal_messages() {
        let mut fx = fixture(&["bot-a"]);
        let pool = fx.engine.pool().clone();
        pool.enqueue(NewMessage::new("bot-a", "chat", "x", 0).with_id("m1"), 0)
            .await
            .unwrap();
        pool.cancel("m1", 0).await.unwrap();

        // Retention is a week by default
        assert_eq!(fx.engine.cleanup().await.unwrap(), 0);
        fx.clock.advance(8 * 24 * 60 * 60 * 1_000);
        assert_eq!(fx.engine.cleanup().await.unwrap(), 1);
        assert!(pool.get("m1").await.unwrap().is_none());
        fx.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let Fixture {
            store,
            clock,
            transport,
            mut engine,
        } = fixture(&["bot-a"]);
        let (tx, rx) = mpsc::channel(1);

        let pool = engine.pool().clone();
        pool.enqueue(NewMessage::new("bot-a", "chat", "hi", 0).with_id("m1"), 0)
            .await
            .unwrap();

        let run = tokio::spawn(async move {
            engine.run(rx).await.unwrap();
            engine
        });

        wait_for(|| transport.deliveries().len() == 1).await;
        tx.send(()).await.unwrap();

        let engine = tokio::time::timeout(Duration::from_secs(3), run).await.unwrap().unwrap();
        assert_eq!(engine.running_count(), 0);

        // Drained worker released its lease
        let leases = LeaseManager::new(store);
        assert!(leases.holder("bot-a", clock.now_ms()).await.unwrap().is_none());
    }
}
