//! Splits a byte stream into varint length-prefixed frames.

use crate::protocol::{Encoder, ProtocolVersion, MAX_FRAME_LENGTH};
use bytes::{Buf, Bytes, BytesMut};

/// A length prefix that can never describe a valid frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length prefix is longer than 5 bytes")]
    PrefixTooLong,
    #[error("frame length {0} is negative")]
    NegativeLength(i32),
    #[error("frame length {length} exceeds the maximum of {max}")]
    TooLong { length: usize, max: usize },
}

/// Buffers incoming bytes and yields complete frames.
///
/// Running out of bytes in the middle of a frame is never an error:
/// the partial frame stays buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_length: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_length,
        }
    }

    /// Appends received bytes to the buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Removes the next complete frame body from the buffer.
    ///
    /// * `Ok(None)`: more bytes are needed.
    /// * `Ok(Some(body))`: a frame was read; more may be available.
    /// * `Err(e)`: the stream is invalid and must be closed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        let Some((length, prefix_size)) = peek_length(&self.buffer)? else {
            return Ok(None);
        };
        if length > self.max_frame_length {
            return Err(FrameError::TooLong {
                length,
                max: self.max_frame_length,
            });
        }
        if self.buffer.len() < prefix_size + length {
            self.buffer.reserve(prefix_size + length - self.buffer.len());
            return Ok(None);
        }
        self.buffer.advance(prefix_size);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Lazily yields every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            failed: false,
        }
    }
}

/// Iterator returned by [`FrameDecoder::frames`]. Stops after the first error.
#[derive(Debug)]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads the length prefix at the start of `buffer` without consuming it.
/// Returns the declared length and the size of the prefix.
fn peek_length(buffer: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value: u32 = 0;
    for (i, byte) in buffer.iter().take(5).enumerate() {
        value |= u32::from(byte & 0b0111_1111) << (7 * i);
        if byte & 0b1000_0000 == 0 {
            let value: i32 = bytemuck::cast(value);
            let length =
                usize::try_from(value).map_err(|_| FrameError::NegativeLength(value))?;
            return Ok(Some((length, i + 1)));
        }
    }
    if buffer.len() >= 5 {
        Err(FrameError::PrefixTooLong)
    } else {
        Ok(None)
    }
}

/// Prefixes `body` with its varint length.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 3);
    let mut encoder = Encoder::new(&mut frame, ProtocolVersion::LATEST);
    encoder.write_var_int(body.len().try_into().unwrap_or(i32::MAX));
    encoder.write_slice(body);
    frame
}

/// Number of bytes `x` takes as a varint.
pub fn var_int_size(x: i32) -> usize {
    let x: u32 = bytemuck::cast(x);
    match x {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_all_complete_frames() {
        let mut decoder = FrameDecoder::default();
        let mut stream = encode_frame(b"first");
        stream.extend(encode_frame(b""));
        stream.extend(encode_frame(b"third"));
        decoder.extend(&stream);

        let frames: Vec<_> = decoder.frames().collect::<Result<_, _>>().unwrap();
        assert_eq!(frames, vec![&b"first"[..], &b""[..], &b"third"[..]]);
        assert!(decoder.buffered().is_empty());
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut decoder = FrameDecoder::default();
        let frame = encode_frame(&[7u8; 300]);
        decoder.extend(&frame[..1]);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.extend(&frame[1..100]);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.extend(&frame[100..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().len(), 300);
        assert_eq!(decoder.next_frame(), Ok(None));
    }

    #[test]
    fn five_byte_prefix_without_terminator_is_invalid() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0x80, 0x80, 0x80, 0x80]);
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.extend(&[0x80]);
        assert_eq!(decoder.next_frame(), Err(FrameError::PrefixTooLong));
    }

    #[test]
    fn oversized_frame_is_rejected_before_it_arrives() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&encode_frame(&[0u8; 1025])[..3]);
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLong {
                length: 1025,
                max: 1024
            })
        );
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(decoder.next_frame(), Err(FrameError::NegativeLength(-1)));
    }

    #[test]
    fn iterator_stops_after_error() {
        let mut decoder = FrameDecoder::new(4);
        let mut stream = encode_frame(b"ok");
        stream.extend(encode_frame(b"too long"));
        stream.extend(encode_frame(b"ok"));
        decoder.extend(&stream);
        let mut frames = decoder.frames();
        assert!(frames.next().unwrap().is_ok());
        assert!(frames.next().unwrap().is_err());
        assert!(frames.next().is_none());
    }

    #[test]
    fn var_int_size_matches_encoder() {
        for x in [0, 1, 127, 128, 16383, 16384, 2097151, 2097152, i32::MAX, -1] {
            let mut buf = Vec::new();
            let written = Encoder::new(&mut buf, ProtocolVersion::LATEST).write_var_int(x);
            assert_eq!(var_int_size(x), written, "{x}");
        }
    }
}
