//! dispatchd - per-identity message dispatch scheduler
//!
//! dispatchd delivers scheduled outbound messages for many independent bot
//! identities without exceeding per-identity rate limits, without sending a
//! message twice, and without losing work across restarts.
//!
//! # Core Concepts
//!
//! - **Shared State Store**: every record lives in a [`store::StateStore`];
//!   processes coordinate only through its conditional writes
//! - **Leased Identities**: one process at a time owns an identity and runs
//!   its single worker
//! - **Persisted Rate Limits**: token buckets survive restarts and hand-overs
//! - **Crash Recovery**: messages stranded in flight are reclaimed by the
//!   next lease holder
//!
//! # Modules
//!
//! - [`store`] - State store trait with SQLite and in-memory backends
//! - [`pool`] - Per-identity message pool
//! - [`limiter`] - Token-bucket rate limiter
//! - [`cooldown`] - Per-target spam protection
//! - [`lease`] - Per-identity leases
//! - [`transport`] - Transport client trait and implementations
//! - [`worker`] - Per-identity worker state machine
//! - [`engine`] - Tick loop and worker supervision
//! - [`admin`] - Producer and operator facades
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod admin;
pub mod cli;
pub mod clock;
pub mod config;
pub mod control;
pub mod cooldown;
pub mod domain;
pub mod engine;
pub mod error;
pub mod lease;
pub mod limiter;
pub mod pool;
pub mod recovery;
pub mod store;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use admin::{Admin, IdentityReport, Producer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, StorageBackend, StorageConfig, TransportConfig, TransportKind};
pub use control::IdentityControl;
pub use cooldown::TargetCooldown;
pub use domain::{
    IdentityConfig, IdentityState, Lease, Message, MessagePriority, MessageStatus, NewMessage, RateLimitBucket, Recurrence,
    TargetActivity,
};
pub use engine::{EngineConfig, SchedulerEngine, TickReport, Wakers};
pub use error::{DispatchError, DispatchResult};
pub use lease::{LeaseManager, LeaseOutcome};
pub use limiter::RateLimiter;
pub use pool::{CancelOutcome, EnqueueOutcome, MessagePool, Transition};
pub use recovery::{RecoveryStats, reclaim_orphans, scan_for_recovery};
pub use store::{CasOutcome, MemoryStore, SqliteStore, StateStore, StoreError};
pub use transport::{ScriptedTransport, SendError, TransportClient, WebhookTransport, create_transport};
pub use worker::{MessageWorker, WorkerExit, WorkerSignal, WorkerState};
