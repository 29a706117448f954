//! FxQuote command line.
//!
//! Every command runs against the configured store with an in-process
//! worker pool, which is drained before the process exits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fxquote_common::parse_duration;
use fxquote_service::{App, LogFormat, ServiceConfig};

#[derive(Debug, Parser)]
#[command(name = "fxquote", version, about = "Asynchronous FX quote updates")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Request an update for a pair such as USD/EUR.
    Request {
        pair: String,
        /// Wait for the update to finish and print it.
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value = "30s", value_parser = duration_arg)]
        wait_timeout: Duration,
    },
    /// Show one update by id.
    Result { id: String },
    /// Show the latest known price for a pair.
    Latest { base: String, quote: String },
    /// Fire concurrent requests for one pair and report how they were deduplicated.
    Burst {
        pair: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Request updates for the given pairs every interval until Ctrl+C.
    Watch {
        #[arg(required = true)]
        pairs: Vec<String>,
        #[arg(long, default_value = "60s", value_parser = duration_arg)]
        interval: Duration,
    },
    /// Check store, cache and queue.
    Ready,
}

#[derive(Debug, Serialize)]
struct BurstReport {
    requested: usize,
    failed: usize,
    distinct_ids: usize,
    tasks_enqueued: u64,
}

fn duration_arg(text: &str) -> Result<Duration, String> {
    parse_duration(text).ok_or_else(|| format!("invalid duration {text:?}, expected e.g. 30s"))
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(app: &App, command: Command) -> anyhow::Result<()> {
    let service = app.service();

    match command {
        Command::Request {
            pair,
            wait,
            wait_timeout,
        } => {
            let ticket = service.request_update(pair).await?;
            print_json(&ticket)?;
            if wait {
                let view = app.await_result(ticket.id, wait_timeout).await?;
                print_json(&view)?;
            }
        }
        Command::Result { id } => print_json(&service.get_result(&id).await?)?,
        Command::Latest { base, quote } => print_json(&service.get_latest((base, quote)).await?)?,
        Command::Burst { pair, count } => {
            let mut handles = Vec::with_capacity(count);
            for _ in 0..count {
                let service = Arc::clone(service);
                let pair = pair.clone();
                handles.push(tokio::spawn(async move { service.request_update(pair).await }));
            }

            let mut ids = HashSet::new();
            let mut failed = 0;
            for handle in handles {
                match handle.await? {
                    Ok(ticket) => {
                        ids.insert(ticket.id);
                    }
                    Err(e) => {
                        warn!(error = %e, "Burst request failed");
                        failed += 1;
                    }
                }
            }

            print_json(&BurstReport {
                requested: count,
                failed,
                distinct_ids: ids.len(),
                tasks_enqueued: app.metrics().snapshot().tasks_enqueued,
            })?;
        }
        Command::Watch { pairs, interval } => {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        for pair in &pairs {
                            match service.request_update(pair.as_str()).await {
                                Ok(ticket) => info!(%pair, update_id = %ticket.id, created = ticket.created, "Update requested"),
                                Err(e) => warn!(%pair, error = %e, code = e.error_code(), "Update request failed"),
                            }
                        }
                    }
                }
            }
        }
        Command::Ready => {
            let readiness = service.readiness().await;
            print_json(&readiness)?;
            if !readiness.is_ready() {
                anyhow::bail!("not ready: {}", readiness.unavailable().join(", "));
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = ServiceConfig::from_env();
    init_tracing(config.log_format);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let app = App::build(config)
        .await
        .context("failed to start quote service")?;
    app.start().await?;

    let outcome = run(&app, cli.command).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }

    app.stop().await?;
    outcome
}
