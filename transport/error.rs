// Transport error type
use nrepl_core::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fatal for the stream: no partial recovery is attempted.
    #[error(transparent)]
    Malformed(#[from] CodecError),

    #[error("stream ended inside a message ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },

    #[error("writer is closed")]
    Closed,

    #[error("writer queue is full")]
    Full,
}
