//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::MessagePriority;

/// Log file shared by the scheduler and admin commands
pub fn log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dispatchd")
        .join("logs")
        .join("dispatchd.log")
}

/// dispatchd - per-identity message dispatch scheduler
#[derive(Parser)]
#[command(
    name = "dispatchd",
    about = "Crash-recoverable per-identity message dispatch scheduler",
    version,
    after_help = "Logs are written to: ~/.local/share/dispatchd/logs/dispatchd.log (filter with DISPATCHD_LOG)"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler in the foreground until interrupted
    Run {
        /// Accept every send without contacting the provider
        #[arg(long)]
        dry_run: bool,
    },

    /// Enqueue a message for an identity
    Enqueue {
        /// Sending identity
        identity: String,

        /// Destination chat
        target: String,

        /// Message body
        payload: String,

        /// Message id for idempotent retries (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Delay dispatch by this many milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Drop the message if not sent within this many milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,

        /// Order among messages due at the same time (low, normal, high, urgent)
        #[arg(short, long, default_value = "normal")]
        priority: MessagePriority,

        /// Send again every this many milliseconds after each delivery
        #[arg(long)]
        repeat_every_ms: Option<u64>,

        /// Stop a repeating message after this many sends
        #[arg(long, requires = "repeat_every_ms")]
        max_occurrences: Option<u32>,
    },

    /// Stop dispatching for an identity
    Pause {
        identity: String,
    },

    /// Resume dispatching for an identity
    Resume {
        identity: String,
    },

    /// Cancel a pending message
    Cancel {
        message_id: String,
    },

    /// Show an identity's queue, lease and error state
    Inspect {
        identity: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List dead-lettered and failed messages
    DeadLetters {
        identity: String,

        /// Maximum messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete terminal messages older than the retention window
    Purge {
        identity: String,

        /// Age in milliseconds (defaults to engine retention-ms)
        #[arg(long)]
        older_than_ms: Option<u64>,
    },
}

/// Output format for inspect/dead-letters
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
