// Server error types
use nrepl_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session {session} is busy evaluating {running}")]
    Busy { session: String, running: String },
}

#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be opened; the server never accepts.
    #[error("failed to bind {address}: {source}")]
    BindFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
