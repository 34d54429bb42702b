//! ClawBridge gateway server.
//!
//! Mediates agent access to a home-automation platform: curated exposure,
//! confirmations, rate limits and an audit trail.

use anyhow::Context;
use clap::Parser;
use clawbridge_core::{init_observability, init_tracing};
use clawbridge_server::{Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing::{info, warn};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "clawbridge")]
#[command(about = "ClawBridge - access-mediation gateway for home-automation agents")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CLAWBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long, env = "CLAWBRIDGE_BIND")]
    bind: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config = config.with_bind_address(bind);
        config.bind_addr().context("invalid --bind address")?;
    }
    if args.print_config {
        println!("{}", config.to_toml().context("failed to render configuration")?);
        return Ok(());
    }

    init_tracing(args.json_logs || *config.json_logs());
    if let Err(e) = init_observability("clawbridge", 60) {
        warn!(error = %e, "Metrics disabled");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "Starting ClawBridge");

    let gateway = Gateway::from_config(config).context("failed to assemble gateway")?;
    gateway
        .serve(shutdown_signal())
        .await
        .context("server failed")?;
    Ok(())
}
