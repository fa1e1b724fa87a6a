use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use vgate::config::Config;
use vgate::server::GatewayServer;

#[derive(Parser)]
#[command(name = "vgate")]
#[command(about = "A programmable reverse HTTP proxy with virtual upstream transports")]
struct Args {
    #[arg(short, long, default_value = "config/vgate.json")]
    config: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("vgate={}", level))
        .init();

    info!("Starting vgate proxy");

    let config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("loading configuration from {}", args.config))?;

    let server = GatewayServer::from_config(config);

    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received CTRL+C, shutting down gracefully...");
            let _ = shutdown_signal.send(());
        }
    });

    server
        .run(shutdown_tx)
        .await
        .context("proxy server failed")?;

    info!("vgate shutdown complete");
    Ok(())
}
