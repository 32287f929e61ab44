//! Scheduler engine
//!
//! Owns the identity registry, the per-identity leases this process holds and
//! the workers running under them.

mod config;
mod core;
mod wakers;

pub use config::EngineConfig;
pub use core::{SchedulerEngine, TickReport};
pub use wakers::Wakers;
