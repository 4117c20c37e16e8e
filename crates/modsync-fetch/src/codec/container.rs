//! The block container: a sequence of `#<hash>:<length>#<payload>` records.
//!
//! There is no index or trailer. A reader scans records front to back until
//! the stream ends cleanly at a record boundary.

use std::io::{self, Write};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use super::CodecError;
use crate::data::MAX_HASH_LEN;

const SEPARATOR: u8 = b'#';
const FIELD_SEPARATOR: u8 = b':';
const MAX_LENGTH_DIGITS: usize = 20;

/// Parsed `#<hash>:<length>#` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Hash exactly as it appeared on the wire.
    pub hash: String,
    /// Byte length of the compressed payload that follows.
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub hash: String,
    pub payload: Bytes,
}

pub struct ContainerWriter<W> {
    inner: W,
    records: usize,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(inner: W) -> Self { Self { inner, records: 0 } }

    pub fn write_record(&mut self, hash: &str, payload: &[u8]) -> io::Result<()> {
        let reserved = |b: u8| b == SEPARATOR || b == FIELD_SEPARATOR;
        if hash.is_empty() || hash.len() > MAX_HASH_LEN || hash.bytes().any(reserved) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("hash {hash:?} cannot be framed"),
            ));
        }
        write!(self.inner, "#{}:{}#", hash, payload.len())?;
        self.inner.write_all(payload)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize { self.records }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Encode `(hash, payload)` pairs into an in-memory container.
pub fn encode_container<I, H, P>(records: I) -> io::Result<Vec<u8>>
where
    I: IntoIterator<Item = (H, P)>,
    H: AsRef<str>,
    P: AsRef<[u8]>,
{
    let mut writer = ContainerWriter::new(Vec::new());
    for (hash, payload) in records {
        writer.write_record(hash.as_ref(), payload.as_ref())?;
    }
    writer.finish()
}

/// Sequential reader over a container stream.
pub struct ContainerReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> ContainerReader<R> {
    pub fn new(inner: R) -> Self { Self { inner: BufReader::new(inner) } }

    /// Read the next header. `Ok(None)` means the stream ended cleanly
    /// between records.
    pub async fn next_header(&mut self) -> Result<Option<RecordHeader>, CodecError> {
        match self.read_byte().await? {
            None => return Ok(None),
            Some(SEPARATOR) => {}
            Some(other) => return Err(CodecError::BadSeparator(other)),
        }

        let mut hash = Vec::with_capacity(64);
        loop {
            match self.read_byte().await? {
                None => return Err(CodecError::UnexpectedEof),
                Some(FIELD_SEPARATOR) => break,
                Some(b) => {
                    if hash.len() == MAX_HASH_LEN {
                        return Err(CodecError::HeaderTooLong(MAX_HASH_LEN));
                    }
                    hash.push(b);
                }
            }
        }

        let mut digits = String::new();
        loop {
            match self.read_byte().await? {
                None => return Err(CodecError::UnexpectedEof),
                Some(SEPARATOR) => break,
                Some(b) if b.is_ascii_digit() => {
                    if digits.len() == MAX_LENGTH_DIGITS {
                        return Err(CodecError::HeaderTooLong(MAX_LENGTH_DIGITS));
                    }
                    digits.push(b as char);
                }
                Some(b) => {
                    digits.push(b as char);
                    return Err(CodecError::InvalidLength(digits));
                }
            }
        }

        // An empty length field is a zero-length record.
        let length = if digits.is_empty() {
            0
        } else {
            digits.parse::<u64>().map_err(|_| CodecError::InvalidLength(digits.clone()))?
        };

        Ok(Some(RecordHeader {
            hash: String::from_utf8_lossy(&hash).into_owned(),
            length,
        }))
    }

    /// Read the next header and its payload.
    ///
    /// A payload shorter than its declared length yields
    /// [`CodecError::Truncated`]; the stream is exhausted at that point.
    pub async fn next_record(&mut self) -> Result<Option<ContainerRecord>, CodecError> {
        let Some(header) = self.next_header().await? else {
            return Ok(None);
        };

        // Grow with the data actually received rather than trusting the
        // declared length for the allocation.
        let mut payload = Vec::with_capacity(header.length.min(1 << 20) as usize);
        let read = (&mut self.inner).take(header.length).read_to_end(&mut payload).await?;
        if (read as u64) < header.length {
            return Err(CodecError::Truncated {
                hash: header.hash,
                expected: header.length,
                actual: read as u64,
            });
        }

        Ok(Some(ContainerRecord {
            hash: header.hash,
            payload: Bytes::from(payload),
        }))
    }

    async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }
}
