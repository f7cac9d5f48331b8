//! Datagram codec for the SPA wire messages.
//!
//! Each UDP datagram carries exactly one protobuf-encoded message with no
//! framing. Datagrams larger than [`MAX_DATAGRAM_SIZE`] are rejected before
//! decoding.

use crate::error::{SpaError, SpaResult};
use crate::messages::{AuthReply, AuthRequest};
use prost::Message;

/// Largest datagram either side will send or accept (the maximum credential size).
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// Encode a message into a single datagram payload.
pub fn encode<M: Message>(message: &M) -> SpaResult<Vec<u8>> {
    let len = message.encoded_len();
    if len > MAX_DATAGRAM_SIZE {
        return Err(SpaError::Decode(format!(
            "message too large: {len} bytes (max {MAX_DATAGRAM_SIZE})"
        )));
    }
    let mut buf = Vec::with_capacity(len);
    message.encode(&mut buf)?;
    Ok(buf)
}

fn decode<M: Message + Default>(data: &[u8]) -> SpaResult<M> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(SpaError::Decode(format!(
            "datagram too large: {} bytes (max {MAX_DATAGRAM_SIZE})",
            data.len()
        )));
    }
    Ok(M::decode(data)?)
}

/// Decode an [`AuthRequest`]. A request without a token is malformed.
pub fn decode_request(data: &[u8]) -> SpaResult<AuthRequest> {
    let request: AuthRequest = decode(data)?;
    if request.token.is_empty() {
        return Err(SpaError::Decode("request carries no token".into()));
    }
    Ok(request)
}

/// Decode an [`AuthReply`]. A reply without a destination is malformed.
pub fn decode_reply(data: &[u8]) -> SpaResult<AuthReply> {
    let reply: AuthReply = decode(data)?;
    if reply.socket.is_empty() {
        return Err(SpaError::Decode("reply carries no socket".into()));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = AuthRequest::new("header.payload.signature");
        let bytes = encode(&request).unwrap();
        assert_eq!(decode_request(&bytes).unwrap(), request);
    }

    #[test]
    fn reply_field_layout() {
        // socket = 1 (length-delimited), expiration = 2 (varint)
        let reply = AuthReply {
            socket: "a:1".into(),
            expiration: 5,
        };
        let bytes = encode(&reply).unwrap();
        assert_eq!(bytes, vec![0x0a, 0x03, b'a', b':', b'1', 0x10, 0x05]);
        assert_eq!(decode_reply(&bytes).unwrap(), reply);
    }

    #[test]
    fn empty_datagram_is_not_a_request() {
        assert!(matches!(decode_request(&[]), Err(SpaError::Decode(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        // Field 1 declared length-delimited with a length running past the end.
        assert!(decode_request(&[0x0a, 0xff, 0x01, b'x']).is_err());
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let data = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(decode_request(&data), Err(SpaError::Decode(_))));
    }

    #[test]
    fn oversized_token_is_not_encoded() {
        let request = AuthRequest::new("x".repeat(MAX_DATAGRAM_SIZE));
        assert!(encode(&request).is_err());
    }
}
