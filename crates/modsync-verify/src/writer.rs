use std::io::{self, Write};

use crate::hasher::{Hasher, to_hex_upper};
use crate::{Result, VerificationError};

/// Write sink that hashes every byte it accepts.
///
/// Decompressed output is written through this wrapper so the digest is
/// computed in the same pass that puts the bytes on disk.
pub struct HashingWriter<W, H> {
    inner: W,
    hasher: H,
    bytes_written: u64,
}

impl<W, H> HashingWriter<W, H> {
    pub fn new(inner: W, hasher: H) -> Self {
        Self {
            inner,
            hasher,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 { self.bytes_written }
}

impl<W: Write, H: Hasher> HashingWriter<W, H> {
    /// Flush the sink and return it together with the raw digest.
    pub fn finish(mut self) -> io::Result<(W, Vec<u8>)> {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize()))
    }

    /// Flush, then compare the digest against a hex string, ignoring case.
    pub fn finish_verified(self, expected_hex: &str) -> Result<W> {
        let (inner, digest) = self.finish()?;
        verify_hex(expected_hex, &digest)?;
        Ok(inner)
    }
}

impl<W: Write, H: Hasher> Write for HashingWriter<W, H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.bytes_written += n as u64;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

/// Compare a raw digest with an expected hex rendering, case-insensitively.
pub fn verify_hex(expected_hex: &str, actual: &[u8]) -> Result<()> {
    let expected = expected_hex.trim();
    if expected.is_empty() || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VerificationError::InvalidHex(expected.to_string()));
    }
    let actual_hex = to_hex_upper(actual);
    if actual_hex.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(VerificationError::Mismatch {
            expected: expected.to_ascii_uppercase(),
            actual: actual_hex,
        })
    }
}
