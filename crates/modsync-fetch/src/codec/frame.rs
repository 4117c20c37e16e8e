use std::io::{self, Read, Write};

use modsync_verify::{HashingWriter, Sha256Hasher};

use super::CodecError;
use crate::data::ContentHash;
use crate::error::Result;

const COMPRESSION_LEVEL: i32 = 3;

/// Compress `data` into one zstd frame.
pub fn compress_frame(data: &[u8]) -> io::Result<Vec<u8>> { zstd::encode_all(data, COMPRESSION_LEVEL) }

/// Decompress one frame from `reader` into `writer`, hashing the output as it
/// is written. Returns the writer and the decompressed byte count once the
/// digest matches `expected`.
///
/// Blocking; run it on a blocking thread when the reader is bridged from
/// async I/O.
pub fn decode_frame_verified<R: Read, W: Write>(
    reader: R,
    writer: W,
    expected: &ContentHash,
) -> Result<(W, u64)> {
    let mut hashing = HashingWriter::new(writer, Sha256Hasher::new());
    zstd::stream::copy_decode(reader, &mut hashing).map_err(CodecError::Frame)?;
    let written = hashing.bytes_written();
    let mut writer = hashing.finish_verified(expected.as_str())?;
    writer.flush()?;
    Ok((writer, written))
}
