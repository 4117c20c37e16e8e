use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("invalid hex digest: {0}")]
    InvalidHex(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, VerificationError>;
