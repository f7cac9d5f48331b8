//! Wire messages exchanged over UDP.
//!
//! Both messages are Protocol Buffers with fixed field tags, so a gateway
//! and a client built from different implementations interoperate as long
//! as they agree on this layout:
//!
//! ```text
//! message AuthRequest { string token = 1; }
//! message AuthReply   { string socket = 1; int64 expiration = 2; }
//! ```

/// A request for access, carrying the signed credential.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthRequest {
    /// Signed credential, passed verbatim to the verifier.
    #[prost(string, tag = "1")]
    pub token: String,
}

/// The gateway's answer to a valid request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthReply {
    /// `host:port` of the destination the requester may now reach.
    #[prost(string, tag = "1")]
    pub socket: String,
    /// Epoch seconds at which the grant lapses.
    #[prost(int64, tag = "2")]
    pub expiration: i64,
}

impl AuthRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}
