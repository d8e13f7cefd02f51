//! On-wire envelope: DEFLATE-compressed frame with an obfuscated TTL
//! smuggled into the otherwise-constant zlib header/trailer bytes.
//!
//! zlib's `Z_DEFAULT_COMPRESSION` preset always starts a stream with the
//! header bytes `0x78 0x9C`; `flate2`'s [`Compression::default()`] is the
//! same preset. Overwriting those two known bytes with the TTL (XORed
//! against the tail of the stream) hides the standard header from casual
//! inspection while costing zero extra bytes on the wire.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// The header bytes zlib emits at `Compression::default()` (level 6).
/// Both ends of the link must use the same preset for this to hold.
const PREAMBLE: [u8; 2] = [0x78, 0x9C];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("datagram too short to carry an envelope")]
    TooShort,
    #[error("deflate failed: {0}")]
    Deflate(String),
    #[error("inflate failed: {0}")]
    Inflate(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Compresses `frame` and wraps it in the obfuscated-TTL envelope.
pub fn encode(frame: &[u8], ttl: u8) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(frame)
        .map_err(|e| CodecError::Deflate(e.to_string()))?;
    let mut compressed = encoder
        .finish()
        .map_err(|e| CodecError::Deflate(e.to_string()))?;

    if compressed.len() < 2 {
        return Err(CodecError::TooShort);
    }

    let len = compressed.len();
    compressed[0] = ttl ^ compressed[len - 1];
    compressed[1] = compressed[len - 2];
    Ok(compressed)
}

/// Recovers `(frame, ttl)` from a datagram produced by [`encode`].
pub fn decode(datagram: &[u8]) -> Result<(Vec<u8>, u8)> {
    if datagram.len() < 2 {
        return Err(CodecError::TooShort);
    }

    let len = datagram.len();
    let ttl = datagram[0] ^ datagram[len - 1];

    let mut restored = datagram.to_vec();
    restored[0] = PREAMBLE[0];
    restored[1] = PREAMBLE[1];

    let mut decoder = ZlibDecoder::new(restored.as_slice());
    let mut frame = Vec::new();
    decoder
        .read_to_end(&mut frame)
        .map_err(|e| CodecError::Inflate(e.to_string()))?;

    Ok((frame, ttl))
}
