//! kiln: operator CLI for a Kiln job database.
//!
//! # Usage
//!
//! ```bash
//! kiln --database ./jobs.db init
//! kiln --database ./jobs.db enqueue --queue default '{"type":"Email"}'
//! kiln --database ./jobs.db fetch --queue critical --queue default --ack
//! kiln --database ./jobs.db run
//! ```
//!
//! Environment variables can also be used:
//! - `KILN_DATABASE`: Path to the SQLite database
//! - `KILN_SCHEMA`: Schema name qualifying every table
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln::config::Config;
use kiln::observability::tracing::init_tracing;
use kiln::storage::NewJob;
use kiln::{CancellationToken, Storage};
use serde_json::{json, Value};
use std::time::Duration;

/// Operator CLI for a Kiln job database.
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema if missing
    Init,
    /// Create a job and put it on a queue
    Enqueue {
        /// Target queue
        #[arg(short, long, default_value = "default")]
        queue: String,
        /// Job payload as JSON
        payload: String,
        /// Expire the job after this many seconds
        #[arg(long)]
        expire_in_secs: Option<u64>,
    },
    /// Claim the next job from one or more queues
    Fetch {
        /// Queues to fetch from, highest priority first
        #[arg(short, long = "queue", default_values_t = vec!["default".to_string()])]
        queues: Vec<String>,
        /// Acknowledge the job instead of putting it back
        #[arg(long)]
        ack: bool,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Show queue and state statistics
    Stats,
    /// Remove expired records once
    Sweep,
    /// Run background components until interrupted
    Run,
}

fn print_value(output: OutputFormat, value: &Value, text: impl FnOnce() -> String) {
    match output {
        OutputFormat::Json => println!("{value}"),
        OutputFormat::Text => println!("{}", text()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level, cli.output == OutputFormat::Json);

    let storage = Storage::open(cli.config.database.clone(), cli.config.storage_options())
        .await
        .with_context(|| format!("failed to open {}", cli.config.database))?;

    match cli.command {
        Commands::Init => {
            print_value(cli.output, &json!({ "storage": storage.to_string() }), || {
                format!("Initialized {storage}")
            });
        }
        Commands::Enqueue {
            queue,
            payload,
            expire_in_secs,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let job_id = storage
                .create_and_enqueue(
                    &queue,
                    &NewJob::new(payload),
                    expire_in_secs.map(Duration::from_secs),
                )
                .await?;
            print_value(cli.output, &json!({ "job_id": job_id, "queue": queue }), || {
                format!("Enqueued job {job_id} on {queue}")
            });
        }
        Commands::Fetch {
            queues,
            ack,
            timeout_secs,
        } => {
            let cancel = CancellationToken::new();
            let timer = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
                timer.cancel();
            });

            let Some(fetched) = storage.fetch(&queues, &cancel).await? else {
                print_value(cli.output, &json!({ "job_id": null }), || {
                    "No job available".to_string()
                });
                return Ok(());
            };

            let job = storage.get_job(fetched.job_id()).await?;
            if ack {
                fetched.remove_from_queue().await?;
            } else {
                fetched.requeue().await?;
            }
            let payload = job.map(|job| job.payload).unwrap_or(Value::Null);
            print_value(
                cli.output,
                &json!({
                    "job_id": fetched.job_id(),
                    "queue": fetched.queue(),
                    "payload": payload,
                    "acknowledged": ack,
                }),
                || format!("Job {} from {}: {}", fetched.job_id(), fetched.queue(), payload),
            );
        }
        Commands::Stats => {
            let monitoring = storage.monitoring();
            let mut queues = Vec::new();
            for queue in monitoring.queues().await? {
                queues.push(monitoring.queue_statistics(&queue).await?);
            }
            let states = monitoring.state_counts().await?;
            print_value(
                cli.output,
                &json!({ "queues": queues, "states": states }),
                || {
                    let mut lines = vec![format!("{storage}")];
                    for q in &queues {
                        lines.push(format!(
                            "  queue {:<20} enqueued {:>6}  fetched {:>6}",
                            q.queue, q.enqueued, q.fetched
                        ));
                    }
                    for (state, count) in &states {
                        lines.push(format!("  state {state:<20} {count:>6}"));
                    }
                    lines.join("\n")
                },
            );
        }
        Commands::Sweep => {
            let report = storage.expiration_manager().sweep_once().await?;
            print_value(cli.output, &json!(report), || {
                format!("Removed {} expired records", report.total())
            });
        }
        Commands::Run => {
            let cancel = CancellationToken::new();
            let components = storage.spawn_components(cancel.clone());
            tracing::info!(components = components.len(), "Running; press Ctrl+C to stop");

            shutdown_signal().await;
            components.shutdown().await;
            tracing::info!("Kiln shutdown complete");
        }
    }

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl+c");
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }
}
