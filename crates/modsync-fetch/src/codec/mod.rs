//! Wire formats: the multi-record block container and single compressed frames.

pub mod container;
pub mod frame;

use std::io;

use thiserror::Error;

pub use container::{ContainerReader, ContainerRecord, ContainerWriter, RecordHeader, encode_container};
pub use frame::{compress_frame, decode_frame_verified};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected '#' record separator, found byte 0x{0:02x}")]
    BadSeparator(u8),

    #[error("record header exceeds {0} bytes")]
    HeaderTooLong(usize),

    #[error("invalid record length field: {0:?}")]
    InvalidLength(String),

    #[error("stream ended inside a record header")]
    UnexpectedEof,

    #[error("record {hash} truncated: expected {expected} bytes, got {actual}")]
    Truncated { hash: String, expected: u64, actual: u64 },

    #[error("frame decode failed: {0}")]
    Frame(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
