use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use wp_sync::config::SyncConfig;
use wp_sync::domain::events::{EventPayload, WpStatusChanged};
use wp_sync::domain::lane::Lane;
use wp_sync::domain::types::{AggregateRef, EventId};
use wp_sync::paths::StatePaths;
use wp_sync::sync::SyncOutcome;
use wp_sync::StatusEngine;

/// Filter for stderr diagnostics, e.g. `WP_SYNC_LOG=wp_sync=debug`.
const LOG_ENV: &str = "WP_SYNC_LOG";

#[derive(Parser)]
#[command(name = "wpsync")]
#[command(about = "Work package status log with offline-first sync")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("WP_SYNC_GIT_SHA"), ")"))]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Config file (defaults to ~/.wp-sync/config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository whose state to use (defaults to current directory)
    #[arg(long, global = true)]
    working_dir: Option<PathBuf>,

    /// Keep all state under this directory instead of ~/.wp-sync
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print this installation's node identity and state location
    Node,
    /// Record a lane change for a work package
    EmitStatus {
        /// Work package id, e.g. WP01
        wp_id: String,
        #[arg(long)]
        from: Lane,
        #[arg(long)]
        to: Lane,
        /// Who made the change
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        reason: Option<String>,
        /// Apply even if the target lane is not reachable
        #[arg(long)]
        force: bool,
        /// Event that triggered this one
        #[arg(long)]
        cause: Option<EventId>,
    },
    /// Record any event from its type name and JSON payload
    Emit {
        /// Event type, e.g. WPAssigned
        event_type: String,
        #[arg(long)]
        payload: String,
        #[arg(long)]
        cause: Option<EventId>,
    },
    /// Show the materialized status of an aggregate (e.g. WP01, Feature/010-auth)
    Status { aggregate: AggregateRef },
    /// Print an aggregate's events in merged order, one JSON object per line
    Log { aggregate: AggregateRef },
    /// Show sync state and events waiting for acknowledgement
    Queue,
    /// Flush the queue to the configured remote
    Sync {
        /// Keep syncing until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::resolve(cli.config.as_deref())?;
    let paths = match &cli.state_dir {
        Some(dir) => StatePaths::under(dir),
        None => {
            let working_dir = match &cli.working_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            StatePaths::for_working_dir(&working_dir)?
        }
    };
    if let Some(dir) = &cli.working_dir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("Failed to enter {}", dir.display()))?;
    }

    let engine = StatusEngine::open(paths, &config)?;

    match cli.command {
        Command::Node => {
            println!("node_id: {}", engine.node_id());
            println!("events:  {}", engine.paths().events_dir.display());
            println!("queue:   {}", engine.paths().queue.display());
            println!("clock:   {}", engine.clock());
        }
        Command::EmitStatus {
            wp_id,
            from,
            to,
            by,
            reason,
            force,
            cause,
        } => {
            let aggregate = AggregateRef::work_package(&wp_id);
            let payload = EventPayload::WpStatusChanged(WpStatusChanged {
                wp_id,
                previous_status: from,
                new_status: to,
                changed_by: by,
                reason,
                force,
            });
            let outcome = engine.emit(payload, aggregate.clone(), cause)?;
            println!("{}", outcome.envelope.event_id);
            print_json(&engine.materialized_status(&aggregate)?)?;
        }
        Command::Emit {
            event_type,
            payload,
            cause,
        } => {
            let body: Value = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let payload = EventPayload::from_parts(&event_type, body)?;
            let aggregate = AggregateRef::new(payload.aggregate_type(), payload.subject_id());
            let outcome = engine.emit(payload, aggregate, cause)?;
            println!("{}", outcome.envelope.event_id);
        }
        Command::Status { aggregate } => {
            print_json(&engine.materialized_status(&aggregate)?)?;
        }
        Command::Log { aggregate } => {
            for envelope in engine.history(&aggregate)? {
                println!("{}", envelope.to_json_line()?);
            }
        }
        Command::Queue => {
            print_json(&engine.sync_status()?)?;
            for envelope in engine.pending_events()? {
                println!(
                    "{}  {:<16} {:<20} clock={}",
                    envelope.event_id,
                    envelope.event_type(),
                    envelope.aggregate,
                    envelope.lamport_clock
                );
            }
        }
        Command::Sync { watch } => {
            let client = engine.tcp_sync_client().context(
                "No remote configured: set remote.address in the config or WP_SYNC_REMOTE",
            )?;
            if watch {
                let client = Arc::new(client);
                let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
                let task = tokio::spawn({
                    let client = Arc::clone(&client);
                    async move { client.run(shutdown_rx).await }
                });
                let mut updates = engine.watch_sync();
                tokio::spawn(async move {
                    while updates.changed().await.is_ok() {
                        let status = updates.borrow_and_update().clone();
                        println!(
                            "{}: {} pending{}",
                            status.state,
                            status.pending,
                            status
                                .last_error
                                .map(|e| format!(" ({})", e))
                                .unwrap_or_default()
                        );
                    }
                });
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for Ctrl-C")?;
                let _ = shutdown_tx.send(true);
                task.await.context("Sync task panicked")?;
            } else {
                match client.sync_once().await? {
                    SyncOutcome::Queued { pending } => {
                        println!("queued: {} event(s) wait for a project identity", pending)
                    }
                    SyncOutcome::Synced {
                        acknowledged,
                        rejected,
                        ingested,
                        pending,
                    } => println!(
                        "synced: {} acknowledged, {} rejected, {} ingested, {} pending",
                        acknowledged, rejected, ingested, pending
                    ),
                    SyncOutcome::Degraded(anomaly) => println!("degraded: {}", anomaly),
                }
            }
        }
    }

    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
