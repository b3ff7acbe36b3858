// Codec error type
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The bytes can never become a valid message, no matter what follows.
    #[error("malformed message at byte {offset}: {reason}")]
    MalformedMessage { offset: usize, reason: String },
}

impl CodecError {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        CodecError::MalformedMessage {
            offset,
            reason: reason.into(),
        }
    }
}
