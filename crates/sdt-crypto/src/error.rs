use sdt_core::TransferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// No identity could open any recipient stanza of the header
    #[error("cannot unseal data key: {0}")]
    KeyUnseal(String),

    /// A block failed authentication, arrived out of sequence, or the stream
    /// was truncated/extended
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Not a container, or an unsupported version/block size
    #[error("malformed container: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for TransferError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::KeyUnseal(m) => TransferError::KeyUnseal(m),
            CodecError::Integrity(m) => TransferError::Integrity(m),
            CodecError::Format(m) => TransferError::Format(m),
            CodecError::Io(e) => TransferError::Io(e),
        }
    }
}
