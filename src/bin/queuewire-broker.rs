use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use queuewire::{Broker, BrokerConfig, Result};

#[derive(Parser, Debug)]
#[command(name = "queuewire-broker")]
#[command(about = "FIFO message-queue broker over a binary TCP protocol")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Byte budget of every queue
    #[arg(long)]
    max_queue_bytes: Option<usize>,

    /// How often timed-out waiters are expired
    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = build_config(&args)?;
    tracing::info!(
        "Starting broker on {} (max {} bytes per queue, sweep every {:?})",
        config.bind_address(),
        config.max_queue_bytes,
        config.sweep_interval()
    );

    let broker = Broker::bind(config).await?;
    broker
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
}

fn build_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_json_file(path)?,
        None => BrokerConfig::default(),
    };

    if let Some(host) = &args.host {
        config = config.with_host(host.clone());
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    if let Some(max) = args.max_queue_bytes {
        config = config.with_max_queue_bytes(max);
    }
    if let Some(ms) = args.sweep_interval_ms {
        config = config.with_sweep_interval(Duration::from_millis(ms));
    }

    config.validate()?;
    Ok(config)
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
