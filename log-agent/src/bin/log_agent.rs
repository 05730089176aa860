//! log-agent - ships access-log lines to InfluxDB.

use anyhow::{Context, Result};
use clap::Parser;
use log_agent::config::{Config, SinkDescriptor};
use log_agent::runner;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "log-agent", version, about)]
struct Args {
    /// TOML configuration file. Built-in defaults apply when omitted.
    #[arg(short, long, env = "LOG_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Access log to tail. Overrides `source.path`.
    #[arg(short, long, env = "LOG_AGENT_PATH")]
    path: Option<String>,

    /// Sink as `address@username@password@database@precision`. Overrides `[sink]`.
    #[arg(long = "influx-dsn", env = "LOG_AGENT_INFLUX_DSN")]
    influx_dsn: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(err) => error!(error = %err, "failed while waiting for shutdown signal"),
            }
            cancel.cancel();
        }
    });

    runner::run(&config, cancel).await?;
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(path) = &args.path {
        config.source.path = path.clone();
    }
    if let Some(dsn) = &args.influx_dsn {
        let descriptor: SinkDescriptor = dsn.parse().context("invalid --influx-dsn")?;
        config.apply_descriptor(&descriptor);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
