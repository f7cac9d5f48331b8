//! spa-client: client side of the Single Packet Authorization exchange.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn example() -> spa_core::SpaResult<()> {
//! let server = spa_client::resolve("gateway.example.com", 1337).await?;
//! let reply = spa_client::request_access(server, "eyJhbGciOi...", Duration::from_secs(5)).await?;
//! println!("{} open until {}", reply.socket, reply.expiration);
//! # Ok(())
//! # }
//! ```

pub mod handshake;

pub use handshake::{request_access, resolve, Handshake, HandshakeState};
