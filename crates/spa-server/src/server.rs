//! Request dispatcher: the UDP receive loop and per-request pipeline.
//!
//! Each valid datagram is handled on its own task:
//! decode → verify → build term → reply → install. The reply goes out
//! before the firewall is touched, and a failed reply never stops the
//! install. Invalid requests get no reply at all.

use crate::config::ServiceConfig;
use crate::keeper::TermKeeper;
use crate::term::Term;
use spa_core::{
    decode_request, encode, unix_now, AuthReply, SpaError, SpaResult, Verifier, MAX_DATAGRAM_SIZE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The gateway's UDP endpoint.
pub struct SpaServer {
    socket: UdpSocket,
    service: Arc<ServiceConfig>,
    verifier: Arc<dyn Verifier>,
    keeper: Arc<TermKeeper>,
}

impl SpaServer {
    pub async fn bind(
        listen: SocketAddr,
        service: Arc<ServiceConfig>,
        verifier: Arc<dyn Verifier>,
        keeper: Arc<TermKeeper>,
    ) -> SpaResult<Self> {
        let socket = UdpSocket::bind(listen).await?;
        Ok(Self {
            socket,
            service,
            verifier,
            keeper,
        })
    }

    pub fn local_addr(&self) -> SpaResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagrams until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> SpaResult<()> {
        let server = Arc::new(self);
        let listen = server.local_addr()?;
        info!(
            listen = %listen,
            service = %server.service.socket(),
            "spa-server ready"
        );

        // One spare byte tells an oversized datagram from one that fits exactly.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            tokio::select! {
                received = server.socket.recv_from(&mut buf) => {
                    let (len, source) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // e.g. ICMP port-unreachable surfacing on Windows.
                            warn!(error = %e, "receive failed");
                            continue;
                        }
                    };
                    if len > MAX_DATAGRAM_SIZE {
                        debug!(source = %source, "dropping oversized datagram");
                        continue;
                    }

                    let data = buf[..len].to_vec();
                    let srv = server.clone();
                    tokio::spawn(async move {
                        srv.dispatch(data, source).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("receive loop stopping");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, data: Vec<u8>, source: SocketAddr) {
        match self.handle(&data, source).await {
            Ok(()) => {}
            Err(SpaError::Decode(reason)) => {
                debug!(source = %source, reason = %reason, "dropping undecodable datagram");
            }
            Err(SpaError::CredentialInvalid(reason)) => {
                warn!(source = %source, reason = %reason, "rejected credential");
            }
            Err(SpaError::ShuttingDown) => {
                debug!(source = %source, "grant withdrawn during shutdown");
            }
            Err(e) => {
                error!(source = %source, error = %e, "failed to grant access");
            }
        }
    }

    async fn handle(&self, data: &[u8], source: SocketAddr) -> SpaResult<()> {
        let request = decode_request(data)?;
        let claims = self.verifier.verify(&request.token)?;
        let term = Term::grant(source, &claims, &self.service, unix_now());

        let reply = AuthReply {
            socket: self.service.socket(),
            expiration: term.expires_at,
        };
        if let Err(e) = self.reply(&reply, source).await {
            warn!(source = %source, error = %e, "reply not delivered");
        }

        self.keeper.install(term).await?;
        Ok(())
    }

    async fn reply(&self, reply: &AuthReply, dest: SocketAddr) -> SpaResult<()> {
        let bytes = encode(reply)?;
        self.socket
            .send_to(&bytes, dest)
            .await
            .map_err(|e| SpaError::ReplyDelivery(e.to_string()))?;
        debug!(dest = %dest, expiration = reply.expiration, "reply sent");
        Ok(())
    }
}
