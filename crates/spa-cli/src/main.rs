//! spa: Single Packet Authorization client CLI.
//!
//! Sends one signed credential to a gateway and prints the destination it
//! opened, or mints credentials for use elsewhere.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::credential::CredentialArgs;
use std::time::Duration;
use tracing::error;

/// spa: Single Packet Authorization client
#[derive(Parser)]
#[command(name = "spa", version, about = "Single Packet Authorization client")]
struct Cli {
    /// Gateway UDP port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Signed token to send (minted from the credential settings if omitted)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Seconds to wait for the gateway's reply
    #[arg(short, long, global = true)]
    deadline: Option<u64>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    credential: CredentialArgs,

    #[command(subcommand)]
    command: Option<Command>,

    /// Gateway host (same as `spa request <server>`)
    server: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Request access from a gateway
    Request {
        /// Gateway host
        server: String,
    },

    /// Print a signed token and exit
    Mint,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("spa=debug,spa_cli=debug,spa_client=debug,spa_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("spa=warn,spa_cli=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = cli
        .config
        .as_deref()
        .map(config::expand_tilde)
        .unwrap_or_else(config::default_path);
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("spa: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Command::Mint) => commands::mint::run(&cli.credential, &cfg.credential),
        Some(Command::Request { ref server }) => request(&cli, server, &cfg).await,
        None => {
            let server = cli
                .server
                .clone()
                .or_else(|| Some(cfg.default.server.clone()).filter(|s| !s.is_empty()));
            match server {
                Some(server) => request(&cli, &server, &cfg).await,
                None => {
                    eprintln!("Usage: spa <server> [--token TOKEN]\n       spa <subcommand>\n\nRun `spa --help` for full usage.");
                    std::process::exit(1);
                }
            }
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("spa: {e:#}");
        std::process::exit(1);
    }
}

async fn request(cli: &Cli, server: &str, cfg: &config::Config) -> anyhow::Result<()> {
    let port = cli.port.unwrap_or(cfg.default.port);
    let deadline = Duration::from_secs(cli.deadline.unwrap_or(cfg.default.deadline));
    let token = commands::credential::resolve(cli.token.as_deref(), &cli.credential, &cfg.credential)?;
    commands::request::run(server, port, &token, deadline).await
}
