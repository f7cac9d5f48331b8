//! spa-core: Shared protocol library for the SPA gateway.
//!
//! Provides the two wire messages and their datagram codec, the error
//! taxonomy shared by server and client, and credential handling: the
//! [`Verifier`] capability, its JWT implementation, and token minting.

pub mod claims;
pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use claims::{mint_token, unix_now, ClaimSet, CredentialAlgorithm, JwtVerifier, Verifier};
pub use codec::{decode_reply, decode_request, encode, MAX_DATAGRAM_SIZE};
pub use error::{SpaError, SpaResult};
pub use messages::{AuthReply, AuthRequest};
