//! Content verification primitives for downloaded assets.
//!
//! Hashes bytes as they are written so that decompression, persistence and
//! integrity checking happen in a single pass.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use modsync_verify::{HashingWriter, Sha256Hasher, to_hex_upper};
//!
//! let expected = to_hex_upper(&Sha256Hasher::digest(b"hello world"));
//!
//! let mut writer = HashingWriter::new(Vec::new(), Sha256Hasher::new());
//! writer.write_all(b"hello world").unwrap();
//! let bytes = writer.finish_verified(&expected).unwrap();
//! assert_eq!(bytes, b"hello world");
//! ```

pub use self::error::{Result, VerificationError};
pub use self::hasher::{Hasher, to_hex_upper};
pub use self::writer::{HashingWriter, verify_hex};

#[cfg(feature = "sha256")]
pub use self::hasher::Sha256Hasher;

mod error;
mod hasher;
mod writer;
