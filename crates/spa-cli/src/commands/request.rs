//! `spa [request] <server>`: ask a gateway for timed access.
//!
//! Resolves the gateway, picks or mints the token, runs the handshake,
//! and prints the granted destination and its expiry.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

pub async fn run(server: &str, port: u16, token: &str, deadline: Duration) -> Result<()> {
    let addr = spa_client::resolve(server, port)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("cannot resolve {server}:{port}"))?;

    info!(server = %addr, "requesting access");
    let reply = spa_client::request_access(addr, token, deadline)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("no grant from {addr}"))?;

    info!(socket = %reply.socket, expiration = reply.expiration, "access granted");
    println!("{}\t{}", reply.socket, reply.expiration);
    Ok(())
}
