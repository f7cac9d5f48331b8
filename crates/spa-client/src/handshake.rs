//! Client handshake.
//!
//! ```text
//! Idle ─send─▶ SentFirst ─▶ Listening ─resend─▶ SentSecond ─▶ AwaitReply ─▶ Done
//!                                                                   └──────▶ TimedOut
//! ```
//!
//! The request goes out twice from the same local endpoint; the reply is
//! awaited on that endpoint. `Listening` marks the point where that endpoint
//! is ready for the reply. No second socket is opened; the resend is kept
//! for compatibility with existing gateways.
//!
//! Datagrams that do not decode as a reply, or that come from any IP other
//! than the one the request was sent to, are ignored. A multihomed gateway
//! listening on a wildcard address may answer from a different IP; such
//! replies are dropped and the handshake times out, so target the gateway
//! by the address it replies from.

use spa_core::{
    decode_reply, encode, AuthReply, AuthRequest, SpaError, SpaResult, MAX_DATAGRAM_SIZE,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    SentFirst,
    Listening,
    SentSecond,
    AwaitReply,
    Done,
    TimedOut,
}

/// One access request against one server.
#[derive(Debug)]
pub struct Handshake {
    server: SocketAddr,
    local: Option<SocketAddr>,
    request: AuthRequest,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(server: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            server,
            local: None,
            request: AuthRequest::new(token),
            state: HandshakeState::Idle,
        }
    }

    /// Send from `local` instead of an ephemeral wildcard endpoint. The
    /// gateway grants access to this address.
    pub fn bind_to(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the exchange, giving up once `deadline` has elapsed.
    ///
    /// There is no retry loop: a lost reply ends in
    /// [`SpaError::Timeout`].
    pub async fn run(&mut self, deadline: Duration) -> SpaResult<AuthReply> {
        let until = Instant::now() + deadline;
        match tokio::time::timeout_at(until, self.exchange()).await {
            Ok(result) => result,
            Err(_) => {
                self.transition(HandshakeState::TimedOut);
                Err(SpaError::Timeout)
            }
        }
    }

    async fn exchange(&mut self) -> SpaResult<AuthReply> {
        let payload = encode(&self.request)?;
        let bind = self.local.unwrap_or_else(|| unspecified_for(&self.server));
        let socket = UdpSocket::bind(bind).await?;

        socket.send_to(&payload, self.server).await?;
        self.transition(HandshakeState::SentFirst);

        // The one socket already listens; the resend is for gateways that
        // expect a second datagram.
        let local = socket.local_addr()?;
        debug!(local = %local, "listening for reply");
        self.transition(HandshakeState::Listening);

        socket.send_to(&payload, self.server).await?;
        self.transition(HandshakeState::SentSecond);

        self.transition(HandshakeState::AwaitReply);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from.ip() != self.server.ip() {
                debug!(from = %from, "ignoring datagram from foreign address");
                continue;
            }
            match decode_reply(&buf[..len]) {
                Ok(reply) => {
                    self.transition(HandshakeState::Done);
                    return Ok(reply);
                }
                Err(e) => debug!(from = %from, error = %e, "ignoring undecodable datagram"),
            }
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "handshake");
        self.state = next;
    }
}

fn unspecified_for(server: &SocketAddr) -> SocketAddr {
    match server {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

/// Send `token` to `server` and wait up to `deadline` for the grant.
pub async fn request_access(
    server: SocketAddr,
    token: &str,
    deadline: Duration,
) -> SpaResult<AuthReply> {
    Handshake::new(server, token).run(deadline).await
}

/// Resolve `host:port` to the first address it names.
pub async fn resolve(host: &str, port: u16) -> SpaResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| SpaError::Other(format!("{host} resolved to no addresses")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spa_core::decode_request;

    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn reply() -> AuthReply {
        AuthReply {
            socket: "10.0.0.5:443".into(),
            expiration: 1_700_000_030,
        }
    }

    #[tokio::test]
    async fn sends_twice_and_accepts_reply() {
        let (server, addr) = fake_server().await;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n1, from1) = server.recv_from(&mut buf).await.unwrap();
            let first = buf[..n1].to_vec();
            let (n2, from2) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(first, buf[..n2].to_vec());
            assert_eq!(from1, from2);
            assert_eq!(decode_request(&first).unwrap().token, "tok");
            server
                .send_to(&encode(&reply()).unwrap(), from2)
                .await
                .unwrap();
        });

        let mut handshake = Handshake::new(addr, "tok");
        assert_eq!(handshake.state(), HandshakeState::Idle);
        let got = handshake.run(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, reply());
        assert_eq!(handshake.state(), HandshakeState::Done);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (_server, addr) = fake_server().await;
        let mut handshake = Handshake::new(addr, "tok");
        let err = handshake.run(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, SpaError::Timeout));
        assert_eq!(handshake.state(), HandshakeState::TimedOut);
    }

    #[tokio::test]
    async fn garbage_before_reply_is_ignored() {
        let (server, addr) = fake_server().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&[0xff, 0xff, 0xff], from).await.unwrap();
            server.send_to(&[], from).await.unwrap();
            server
                .send_to(&encode(&reply()).unwrap(), from)
                .await
                .unwrap();
        });

        let got = request_access(addr, "tok", Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, reply());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn foreign_sender_is_ignored() {
        let (server, addr) = fake_server().await;
        let foreign = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let spoofed = AuthReply {
                socket: "203.0.113.1:22".into(),
                expiration: 1,
            };
            foreign
                .send_to(&encode(&spoofed).unwrap(), from)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            server
                .send_to(&encode(&reply()).unwrap(), from)
                .await
                .unwrap();
        });

        let got = request_access(addr, "tok", Duration::from_secs(5)).await.unwrap();
        assert_eq!(got, reply());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn reply_from_other_gateway_address_times_out() {
        let (server, addr) = fake_server().await;
        let other = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            other
                .send_to(&encode(&reply()).unwrap(), from)
                .await
                .unwrap();
        });

        let mut handshake = Handshake::new(addr, "tok");
        let err = handshake.run(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, SpaError::Timeout));
        assert_eq!(handshake.state(), HandshakeState::TimedOut);
    }

    #[tokio::test]
    async fn sends_from_bound_address() {
        let (server, addr) = fake_server().await;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            server
                .send_to(&encode(&reply()).unwrap(), from)
                .await
                .unwrap();
            from
        });

        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut handshake = Handshake::new(addr, "tok").bind_to(local);
        handshake.run(Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.await.unwrap().ip(), local.ip());
    }

    #[tokio::test]
    async fn resolves_literal_address() {
        let addr = resolve("127.0.0.1", 1337).await.unwrap();
        assert_eq!(addr, "127.0.0.1:1337".parse().unwrap());
    }
}
