//! Error types for modsync-fetch.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid content hash: {0:?}")]
    InvalidHash(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("container: {0}")]
    Codec(#[from] CodecError),

    #[error("verification: {0}")]
    Verify(#[from] modsync_verify::VerificationError),

    #[error("filesystem: {0}")]
    Fs(#[from] modsync_fs::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_cancelled(&self) -> bool { matches!(self, Error::Cancelled) }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self { Error::Config(e.to_string()) }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::InvalidResponse(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, Error>;
