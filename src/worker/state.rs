//! Worker states, control signals, exit reasons

use std::fmt;

/// Position of a worker in its dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Fetching,
    Sending,
    Recording,
    Backoff,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Fetching => "fetching",
            WorkerState::Sending => "sending",
            WorkerState::Recording => "recording",
            WorkerState::Backoff => "backoff",
            WorkerState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Control signal from the engine, carried on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerSignal {
    #[default]
    Run,
    /// Finish the current send/record step, then exit
    Drain,
    /// Identity paused or engine asked it to step down
    Stop,
    /// Lease renewal failed or another holder owns the lease
    LeaseLost,
}

/// Why a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Drained,
    LeaseLost,
    Stopped,
    ConnectFailed(String),
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Drained => write!(f, "drained"),
            WorkerExit::LeaseLost => write!(f, "lease lost"),
            WorkerExit::Stopped => write!(f, "stopped"),
            WorkerExit::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
        }
    }
}

impl WorkerSignal {
    /// Exit reason the signal asks for, if any
    pub fn exit(&self) -> Option<WorkerExit> {
        match self {
            WorkerSignal::Run => None,
            WorkerSignal::Drain => Some(WorkerExit::Drained),
            WorkerSignal::Stop => Some(WorkerExit::Stopped),
            WorkerSignal::LeaseLost => Some(WorkerExit::LeaseLost),
        }
    }
}
