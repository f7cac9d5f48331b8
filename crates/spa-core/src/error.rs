use thiserror::Error;

/// Errors produced by the SPA gateway and client.
#[derive(Debug, Error)]
pub enum SpaError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("credential rejected: {0}")]
    CredentialInvalid(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("firewall error: {0}")]
    Firewall(String),

    #[error("reply delivery failed: {0}")]
    ReplyDelivery(String),

    #[error("timeout")]
    Timeout,

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<prost::DecodeError> for SpaError {
    fn from(e: prost::DecodeError) -> Self {
        SpaError::Decode(e.to_string())
    }
}

impl From<prost::EncodeError> for SpaError {
    fn from(e: prost::EncodeError) -> Self {
        SpaError::Decode(e.to_string())
    }
}

pub type SpaResult<T> = Result<T, SpaError>;
