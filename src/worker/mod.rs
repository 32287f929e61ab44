//! Per-identity message workers

pub mod backoff;
mod core;
mod state;

pub use core::{MessageWorker, StepOutcome, WorkerConfig, WorkerControl, WorkerDeps, WorkerLink, link};
pub use state::{WorkerExit, WorkerSignal, WorkerState};
