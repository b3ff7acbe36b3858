// Client error types
use nrepl_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// No terminal status arrived before the request's deadline. The
    /// connection and other requests are unaffected.
    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection failed: {0}")]
    Connection(#[from] std::io::Error),

    #[error("request id already pending: {0}")]
    DuplicateId(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
