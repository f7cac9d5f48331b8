//! spa-server: Single Packet Authorization gateway.

use clap::Parser;
use spa_server::{firewall, ServerConfig, SpaServer, TermKeeper};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// spa-server: Single Packet Authorization gateway
#[derive(Parser, Debug)]
#[command(name = "spa-server", version, about = "Single Packet Authorization gateway")]
struct Cli {
    /// Address to listen on (overrides the config file)
    #[arg(long)]
    listen_addr: Option<IpAddr>,

    /// UDP port to listen on (overrides the config file)
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Config file path
    #[arg(short, long, default_value = "./spa.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting spa-server");

    let config = match ServerConfig::load(
        &PathBuf::from(&cli.config),
        cli.listen_addr,
        cli.listen_port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let verifier = match config.verification.verifier() {
        Ok(v) => Arc::new(v),
        Err(e) => {
            error!(error = %e, "failed to build verifier");
            std::process::exit(1);
        }
    };

    let binding = match firewall::from_config(&config.firewall) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to set up firewall binding");
            std::process::exit(1);
        }
    };

    let keeper = Arc::new(TermKeeper::new(binding));
    let service = Arc::new(config.service.clone());
    let server = match SpaServer::bind(config.listen, service, verifier, keeper.clone()).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, listen = %config.listen, "failed to bind");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let sweeper = keeper.clone().spawn_sweeper(shutdown_tx.subscribe());
    let mut receiver = tokio::spawn(server.run(shutdown_tx.subscribe()));

    tokio::select! {
        result = &mut receiver => {
            match result {
                Ok(Err(e)) => error!(error = %e, "server error"),
                Err(e) => error!(error = %e, "server task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task failed");
    }
    if !receiver.is_finished() {
        receiver.abort();
    }

    let revoked = keeper.shutdown().await;
    info!(revoked, "spa-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler; waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
