//! The per-connection byte pipeline: cipher, framing and compression,
//! in each direction.
//!
//! Both halves start in plain mode. Compression and encryption are
//! switched on once, at login, and never switched off.

use crate::protocol::{
    compress, decompress, encode_frame, CipherError, CompressionError, CompressionThreshold,
    Decryptor, EncryptionKey, Encryptor, FrameDecoder, FrameError, MAX_FRAME_LENGTH,
};
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("compression is already enabled on this connection")]
    CompressionAlreadyEnabled,
}

/// Turns received bytes into packet bodies (packet id + payload).
pub struct InboundCodec {
    frames: FrameDecoder,
    decryptor: Option<Decryptor>,
    compression: Option<CompressionThreshold>,
}

impl InboundCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            frames: FrameDecoder::new(max_frame_length),
            decryptor: None,
            compression: None,
        }
    }

    /// Gives data to the internal read buffer.
    ///
    /// `data` is decrypted in place if encryption is enabled.
    pub fn give_data(&mut self, mut data: impl AsMut<[u8]>) {
        let data = data.as_mut();
        if let Some(decryptor) = &mut self.decryptor {
            decryptor.decrypt(data);
        }
        self.frames.extend(data);
    }

    /// Attempts to take the next packet body.
    ///
    /// Call in a loop after `give_data` until it returns `Ok(None)`.
    /// An error invalidates the stream.
    pub fn next_body(&mut self) -> Result<Option<Bytes>, CodecError> {
        let Some(frame) = self.frames.next_frame()? else {
            return Ok(None);
        };
        match self.compression {
            Some(threshold) => Ok(Some(decompress(frame, threshold)?)),
            None => Ok(Some(frame)),
        }
    }

    /// Switches on decryption.
    ///
    /// Bytes already buffered arrived after the last plaintext frame
    /// the caller consumed, so they are decrypted now.
    pub fn enable_encryption(&mut self, key: EncryptionKey) -> Result<(), CipherError> {
        if self.decryptor.is_some() {
            return Err(CipherError::AlreadyEnabled);
        }
        let mut decryptor = Decryptor::new(key);
        decryptor.decrypt(self.frames.buffered());
        self.decryptor = Some(decryptor);
        Ok(())
    }

    pub fn enable_compression(&mut self, threshold: CompressionThreshold) -> Result<(), CodecError> {
        if self.compression.is_some() {
            return Err(CodecError::CompressionAlreadyEnabled);
        }
        self.compression = Some(threshold);
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }
}

/// Turns packet bodies into bytes ready for the wire.
pub struct OutboundCodec {
    encryptor: Option<Encryptor>,
    compression: Option<CompressionThreshold>,
    max_frame_length: usize,
}

impl OutboundCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            encryptor: None,
            compression: None,
            max_frame_length,
        }
    }

    /// Compresses (if enabled), frames and encrypts (if enabled) one packet body.
    pub fn encode_body(&mut self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut bytes = match self.compression {
            Some(threshold) => {
                let compressed = compress(body, threshold)?;
                self.check_length(compressed.len())?;
                encode_frame(&compressed)
            }
            None => {
                self.check_length(body.len())?;
                encode_frame(body)
            }
        };
        if let Some(encryptor) = &mut self.encryptor {
            encryptor.encrypt(&mut bytes);
        }
        Ok(bytes)
    }

    fn check_length(&self, length: usize) -> Result<(), FrameError> {
        if length > self.max_frame_length {
            Err(FrameError::TooLong {
                length,
                max: self.max_frame_length,
            })
        } else {
            Ok(())
        }
    }

    pub fn enable_encryption(&mut self, key: EncryptionKey) -> Result<(), CipherError> {
        if self.encryptor.is_some() {
            return Err(CipherError::AlreadyEnabled);
        }
        self.encryptor = Some(Encryptor::new(key));
        Ok(())
    }

    pub fn enable_compression(&mut self, threshold: CompressionThreshold) -> Result<(), CodecError> {
        if self.compression.is_some() {
            return Err(CodecError::CompressionAlreadyEnabled);
        }
        self.compression = Some(threshold);
        Ok(())
    }
}

/// Both halves of a connection's codec, for use before the
/// connection is split into independent reader and writer tasks.
pub struct PacketCodec {
    pub inbound: InboundCodec,
    pub outbound: OutboundCodec,
}

impl PacketCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inbound: InboundCodec::new(max_frame_length),
            outbound: OutboundCodec::new(max_frame_length),
        }
    }

    pub fn enable_encryption(&mut self, key: EncryptionKey) -> Result<(), CipherError> {
        self.inbound.enable_encryption(key)?;
        self.outbound.enable_encryption(key)
    }

    pub fn enable_compression(&mut self, threshold: CompressionThreshold) -> Result<(), CodecError> {
        self.inbound.enable_compression(threshold)?;
        self.outbound.enable_compression(threshold)
    }

    pub fn split(self) -> (InboundCodec, OutboundCodec) {
        (self.inbound, self.outbound)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LENGTH)
    }
}
