//! zlib compression of frame bodies once a threshold has been negotiated.

use crate::protocol::{DecodeError, Decoder, Encoder, ProtocolVersion};
use bytes::Bytes;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Relayed packets are mostly small, so favor speed over ratio.
const COMPRESSION_LEVEL: Compression = Compression::fast();

/// Largest inflated body accepted, to bound memory use per packet.
pub const MAX_UNCOMPRESSED_LENGTH: usize = 8 * 1024 * 1024;

/// Threshold in bytes at which a packet body is compressed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompressionThreshold(usize);

impl CompressionThreshold {
    /// Returns `None` for negative thresholds, which disable compression.
    pub fn new(threshold: i32) -> Option<Self> {
        usize::try_from(threshold).ok().map(Self)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("invalid data length prefix: {0}")]
    Header(#[from] DecodeError),
    #[error("compressed packet claims {claimed} bytes, below the threshold of {threshold}")]
    BelowThreshold { claimed: usize, threshold: usize },
    #[error("compressed packet claims {claimed} bytes, above the limit of {max}")]
    TooLarge { claimed: usize, max: usize },
    #[error("packet inflated to {actual} bytes but declared {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("corrupt zlib stream: {0}")]
    Corrupt(#[source] io::Error),
    #[error("deflate failed: {0}")]
    Deflate(#[source] io::Error),
}

/// Wraps a packet body in the compressed format: a varint data length
/// (0 when sent raw) followed by the raw or zlib-deflated body.
pub fn compress(body: &[u8], threshold: CompressionThreshold) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(body.len() + 5);
    let mut encoder = Encoder::new(&mut out, ProtocolVersion::LATEST);
    // A data length of 0 marks a raw body, so an empty body is never deflated.
    if body.is_empty() || body.len() < threshold.get() {
        encoder.write_var_int(0);
        encoder.write_slice(body);
        return Ok(out);
    }

    encoder.write_var_int(body.len().try_into().unwrap_or(i32::MAX));
    let mut zlib = flate2::write::ZlibEncoder::new(out, COMPRESSION_LEVEL);
    zlib.write_all(body).map_err(CompressionError::Deflate)?;
    zlib.finish().map_err(CompressionError::Deflate)
}

/// Unwraps a compressed-format frame body, inflating it if needed.
///
/// The inflated size must match the declared size exactly.
pub fn decompress(
    frame: Bytes,
    threshold: CompressionThreshold,
) -> Result<Bytes, CompressionError> {
    let mut decoder = Decoder::new(&frame, ProtocolVersion::LATEST);
    let (claimed, prefix_size) = decoder.read_var_int_with_size()?;
    let claimed = usize::try_from(claimed).map_err(DecodeError::IntConversion)?;
    if claimed == 0 {
        return Ok(frame.slice(prefix_size..));
    }
    if claimed < threshold.get() {
        return Err(CompressionError::BelowThreshold {
            claimed,
            threshold: threshold.get(),
        });
    }
    if claimed > MAX_UNCOMPRESSED_LENGTH {
        return Err(CompressionError::TooLarge {
            claimed,
            max: MAX_UNCOMPRESSED_LENGTH,
        });
    }

    let mut inflated = Vec::with_capacity(claimed);
    flate2::read::ZlibDecoder::new(decoder.buffer())
        .take(claimed as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(CompressionError::Corrupt)?;
    if inflated.len() != claimed {
        return Err(CompressionError::LengthMismatch {
            declared: claimed,
            actual: inflated.len(),
        });
    }
    Ok(inflated.into())
}
