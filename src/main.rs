//! dispatchd - per-identity message dispatch scheduler
//!
//! CLI entry point for running the scheduler and operating on its state.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use dispatchd::admin::{Admin, IdentityReport, Producer};
use dispatchd::cli::{Cli, Command, OutputFormat, log_path};
use dispatchd::clock::{Clock, SystemClock};
use dispatchd::config::{Config, StorageBackend, StorageConfig, TransportKind};
use dispatchd::domain::{Message, NewMessage};
use dispatchd::engine::SchedulerEngine;
use dispatchd::pool::{CancelOutcome, EnqueueOutcome};
use dispatchd::store::{MemoryStore, SqliteStore, StateStore};
use dispatchd::transport::{ScriptedTransport, TransportClient, create_transport};

/// Log to the shared file; a foreground `run` also prints warnings to stderr
///
/// `DISPATCHD_LOG` overrides the filter (same syntax as `RUST_LOG`).
fn setup_logging(verbose: bool, foreground: bool) -> Result<()> {
    let log_path = log_path();
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }

    // Admin commands share the file with a running scheduler
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let default_filter = if verbose { "info,dispatchd=debug" } else { "info" };
    let filter = EnvFilter::try_from_env("DISPATCHD_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console = foreground.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(LevelFilter::WARN)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(log_file).with_ansi(false))
        .with(console)
        .init();

    info!(pid = std::process::id(), verbose, foreground, "dispatchd logging started");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let foreground = matches!(cli.command, Some(Command::Run { .. }));
    setup_logging(cli.verbose, foreground).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        "dispatchd loaded config: identities={}, storage={:?}, transport={:?}",
        config.identities.len(),
        config.storage.backend,
        config.transport.kind
    );

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match command {
        Command::Run { dry_run } => cmd_run(config, dry_run, clock).await,
        Command::Enqueue {
            identity,
            target,
            payload,
            id,
            delay_ms,
            ttl_ms,
            priority,
            repeat_every_ms,
            max_occurrences,
        } => {
            let now = clock.now_ms();
            let mut new = NewMessage::new(identity, target, payload, now + delay_ms as i64).with_priority(priority);
            if let Some(id) = id {
                new = new.with_id(id);
            }
            if let Some(ttl) = ttl_ms {
                new = new.with_expiry(now + ttl as i64);
            }
            if let Some(every) = repeat_every_ms {
                new = new.repeating(every, max_occurrences);
            }
            cmd_enqueue(&config, new, clock).await
        }
        Command::Pause { identity } => {
            admin(&config, clock)?.pause(&identity).await?;
            println!("{} {}", "Paused".yellow(), identity);
            Ok(())
        }
        Command::Resume { identity } => {
            admin(&config, clock)?.resume(&identity).await?;
            println!("{} {}", "Resumed".green(), identity);
            Ok(())
        }
        Command::Cancel { message_id } => cmd_cancel(&config, &message_id, clock).await,
        Command::Inspect { identity, format } => cmd_inspect(&config, &identity, format, clock).await,
        Command::DeadLetters {
            identity,
            limit,
            format,
        } => cmd_dead_letters(&config, &identity, limit, format, clock).await,
        Command::Purge {
            identity,
            older_than_ms,
        } => {
            let older_than = older_than_ms.unwrap_or(config.engine.retention_ms);
            let purged = admin(&config, clock)?.purge(&identity, older_than).await?;
            println!("Purged {} messages for {}", purged, identity);
            Ok(())
        }
    }
}

/// Open the configured state store
fn open_store(storage: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    match storage.backend {
        StorageBackend::Sqlite => {
            let store = SqliteStore::open(&storage.path)
                .with_context(|| format!("Failed to open state store at {}", storage.path.display()))?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory store; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn admin(config: &Config, clock: Arc<dyn Clock>) -> Result<Admin> {
    Ok(Admin::new(open_store(&config.storage)?, clock))
}

/// Run the scheduler until SIGINT/SIGTERM
async fn cmd_run(config: Config, dry_run: bool, clock: Arc<dyn Clock>) -> Result<()> {
    if !dry_run {
        config.check_credentials()?;
    }
    if config.identities.is_empty() {
        warn!("No identities configured; the scheduler will idle");
    }

    let store = open_store(&config.storage)?;

    let transport: Arc<dyn TransportClient> = if dry_run || config.transport.kind == TransportKind::DryRun {
        info!("Dry run: sends are accepted without contacting the provider");
        Arc::new(ScriptedTransport::new())
    } else {
        create_transport(&config.transport).context("Failed to create transport")?
    };

    let mut engine = SchedulerEngine::new(config.engine.clone(), config.identities.clone(), store, transport, clock)
        .context("Failed to create scheduler engine")?;
    println!(
        "dispatchd running {} identities as {} (Ctrl+C to stop)",
        config.identities.len(),
        engine.holder()
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let engine_handle = tokio::spawn(async move { engine.run(shutdown_rx).await });

    // Set up signal handlers
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        // On non-Unix, just wait for Ctrl+C
        tokio::signal::ctrl_c().await?;
    }

    info!("Scheduler shutting down...");
    let _ = shutdown_tx.send(()).await;

    engine_handle.await.context("Scheduler task failed")??;
    println!("dispatchd stopped");
    Ok(())
}

async fn cmd_enqueue(config: &Config, new: NewMessage, clock: Arc<dyn Clock>) -> Result<()> {
    if !config.identities.is_empty() && config.identity(&new.identity_id).is_none() {
        warn!(identity_id = %new.identity_id, "Enqueue for an identity missing from config");
        eprintln!("{} identity '{}' is not configured", "Warning:".yellow(), new.identity_id);
    }

    let producer = Producer::new(open_store(&config.storage)?, clock);
    match producer.enqueue(new).await? {
        EnqueueOutcome::Accepted(message) => {
            print!("{} {} [{}]", "Enqueued".green(), message.id, message.priority);
            match &message.recurrence {
                Some(recurrence) => println!(" repeating every {} ms", recurrence.every_ms),
                None => println!(),
            }
        }
        EnqueueOutcome::Duplicate(message) => {
            println!("{} {} ({})", "Already enqueued".yellow(), message.id, message.status)
        }
    }
    Ok(())
}

async fn cmd_cancel(config: &Config, message_id: &str, clock: Arc<dyn Clock>) -> Result<()> {
    match admin(config, clock)?.cancel(message_id).await? {
        CancelOutcome::Cancelled => println!("{} {}", "Cancelled".green(), message_id),
        CancelOutcome::InFlight => println!("{} {} is being sent", "In flight:".yellow(), message_id),
        CancelOutcome::AlreadyTerminal(status) => println!("{} is already {}", message_id, status),
        CancelOutcome::NotFound => {
            return Err(eyre::eyre!("message {} not found", message_id));
        }
    }
    Ok(())
}

async fn cmd_inspect(config: &Config, identity: &str, format: OutputFormat, clock: Arc<dyn Clock>) -> Result<()> {
    let report = admin(config, clock)?.inspect(identity).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &IdentityReport) {
    println!("Identity {}", report.identity_id.bold());
    println!("-----------------");
    let state = if report.paused {
        "paused".yellow()
    } else if report.online {
        "online".green()
    } else {
        "offline".normal()
    };
    println!("State: {}", state);
    match &report.lease_holder {
        Some(holder) => println!("Lease: {} (until {})", holder, format_ms(report.lease_expires_at)),
        None => println!("Lease: none"),
    }
    println!("Pending: {}", report.pending_count);
    println!("Sent: {}", report.sent_count);
    println!("Dead-lettered: {}", report.dead_letter_count);
    println!("Failed: {}", report.failed_count);
    if let Some(error) = &report.last_error {
        println!("Last error: {} ({})", error.red(), format_ms(report.last_error_at));
    }
}

async fn cmd_dead_letters(
    config: &Config,
    identity: &str,
    limit: usize,
    format: OutputFormat,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    let messages = admin(config, clock)?.dead_letters(identity, limit).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&messages)?),
        OutputFormat::Text => {
            if messages.is_empty() {
                println!("No dead letters for {}", identity);
            }
            for message in &messages {
                print_dead_letter(message);
            }
        }
    }
    Ok(())
}

fn print_dead_letter(message: &Message) {
    println!(
        "{} {} -> {} [{}] attempts={} finished={}",
        message.id,
        message.identity_id,
        message.target,
        message.status.to_string().red(),
        message.attempt_count,
        format_ms(message.finished_at)
    );
    if let Some(error) = &message.last_error {
        println!("    {}", error);
    }
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
