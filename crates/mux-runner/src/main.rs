//! # mux-runner
//!
//! Command-line driver for the duplex client.
//!
//! Loads a JSON configuration file, subscribes to the configured channels
//! (logging every push), optionally issues one request, and runs until
//! Ctrl+C, then disposes the client.
//!
//! # Usage
//!
//! ```bash
//! mux-runner config.json --log-level info
//! mux-runner config.json --invoke public/get_time
//! mux-runner config.json --invoke public/get_index_price --params '{"index_name":"btc_usd"}'
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mux_client::DuplexClient;
use mux_core::Push;
use mux_core::logging::{LogOptions, init_logging};
use serde_json::Value;
use tokio::time::Interval;
use tracing::{error, info};

/// Duplex JSON-RPC client runner.
#[derive(Parser)]
#[command(name = "mux-runner", about = "Duplex JSON-RPC client runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log directory for file output; overrides `log.log_path` in the config.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit JSON log lines on the console.
    #[arg(long)]
    json_logs: bool,

    /// Method to invoke once at startup.
    #[arg(long)]
    invoke: Option<String>,

    /// JSON params for `--invoke`.
    #[arg(long, default_value = "{}", requires = "invoke")]
    params: String,

    /// Seconds between status lines (0 disables).
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = mux_core::config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // 2. Initialize logging
    let module_name = config.module_name();
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    init_logging(&LogOptions {
        level: &cli.log_level,
        dir: log_dir.as_deref(),
        file_prefix: &module_name,
        json: cli.json_logs,
    })?;
    info!(
        "mux-runner starting: config={}, log_level={}, endpoint={}",
        cli.config.display(),
        cli.log_level,
        config.client.endpoint()?
    );

    // 3. Build the client and subscribe
    let client = DuplexClient::new(config.client.clone())?;
    let mut subscriptions = Vec::with_capacity(config.subscriptions.len());
    for channel in &config.subscriptions {
        subscriptions.push(client.subscribe(channel, log_push)?);
        info!("subscribed to '{channel}'");
    }

    // 4. One-shot request
    if let Some(method) = &cli.invoke {
        let params: Value = serde_json::from_str(&cli.params).context("parsing --params")?;
        match client.invoke(method, params).await {
            Ok(result) => info!("{method} -> {result}"),
            Err(e) => error!("{method} failed: {e}"),
        }
        if subscriptions.is_empty() {
            client.dispose().await;
            return Ok(());
        }
    }

    info!("{} subscription(s) active, press Ctrl+C to stop", subscriptions.len());

    // 5. Run until shutdown signal
    let mut stats_tick = (cli.stats_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.stats_interval)));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown signal received");
                break;
            }
            _ = next_tick(&mut stats_tick) => {
                let stats = client.stats();
                info!(
                    "status: state={} epoch={} pending={} queued={} channels={}",
                    stats.state, stats.epoch, stats.pending_requests, stats.queued_messages, stats.channels
                );
            }
        }
    }

    // 6. Tear down (deactivates every channel in one request)
    client.dispose().await;
    info!("client disposed, goodbye");
    Ok(())
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_push(push: &Push) {
    info!(channel = %push.channel, "{}", push.data);
}
