//! AES-128 in CFB8 mode, the stream cipher used once a connection
//! has completed its key exchange.

use aes::{cipher::generic_array::GenericArray, Aes128};
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::{fmt, slice};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("shared secret must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption is already enabled on this connection")]
    AlreadyEnabled,
}

/// Shared secret used as both key and IV.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 16]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        <[u8; 16]>::try_from(bytes)
            .map(Self)
            .map_err(|_| CipherError::InvalidKeyLength(bytes.len()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn split(self) -> (Encryptor, Decryptor) {
        (Encryptor::new(self), Decryptor::new(self))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Outbound half of the cipher. Keeps its own feedback register.
pub struct Encryptor(cfb8::Encryptor<Aes128>);

impl Encryptor {
    pub fn new(key: EncryptionKey) -> Self {
        Self(cfb8::Encryptor::new(&key.0.into(), &key.0.into()))
    }

    /// Encrypts `data` in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            let slice = slice::from_mut(byte);
            self.0.encrypt_block_mut(GenericArray::from_mut_slice(slice));
        }
    }
}

/// Inbound half of the cipher.
pub struct Decryptor(cfb8::Decryptor<Aes128>);

impl Decryptor {
    pub fn new(key: EncryptionKey) -> Self {
        Self(cfb8::Decryptor::new(&key.0.into(), &key.0.into()))
    }

    /// Decrypts `data` in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data {
            let slice = slice::from_mut(byte);
            self.0.decrypt_block_mut(GenericArray::from_mut_slice(slice));
        }
    }
}
