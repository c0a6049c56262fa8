use crate::protocol::ProtocolVersion;
use std::{convert::Infallible, num::TryFromIntError, str::Utf8Error};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of packet: wanted {needed} bytes, {available} left")]
    EndOfStream { needed: usize, available: usize },
    #[error("byte {0} is not a boolean")]
    InvalidBool(u8),
    #[error("VarInt runs past 5 bytes")]
    VarIntTooLong,
    #[error("string is longer than {MAX_STRING_CHARS} characters")]
    StringTooLong,
    #[error("unknown discriminant {0}")]
    InvalidDiscriminant(i64),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    IntConversion(#[from] TryFromIntError),
    /// Lets derived code apply `?` to infallible integer conversions.
    #[error(transparent)]
    Infallible(#[from] Infallible),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// Protocol limit on string length, in characters.
const MAX_STRING_CHARS: usize = 32_767;
/// A character takes at most 3 bytes on the wire.
const MAX_STRING_BYTES: usize = MAX_STRING_CHARS * 3;

/// Reads values off the front of a packet body.
///
/// The protocol version decides which version-gated fields are present.
#[derive(Debug)]
pub struct Decoder<'a> {
    rest: &'a [u8],
    version: ProtocolVersion,
}

/// A value with a wire form.
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder) -> Result<Self>;
}

/// Big-endian fixed-width integers: one `read_*` method each, plus the
/// matching `Decode` impl.
macro_rules! fixed_width {
    ($($method:ident => $ty:ty),* $(,)?) => {
        impl Decoder<'_> {
            $(
                pub fn $method(&mut self) -> Result<$ty> {
                    self.take_array().map(<$ty>::from_be_bytes)
                }
            )*
        }

        $(
            impl Decode for $ty {
                fn decode(decoder: &mut Decoder) -> Result<Self> {
                    decoder.$method()
                }
            }
        )*
    };
}

fixed_width! {
    read_u8 => u8,
    read_i8 => i8,
    read_u16 => u16,
    read_i16 => i16,
    read_i32 => i32,
    read_i64 => i64,
    read_u128 => u128,
}

impl<'a> Decoder<'a> {
    pub fn new(body: &'a [u8], version: ProtocolVersion) -> Self {
        Self {
            rest: body,
            version,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The bytes not read yet.
    pub fn buffer(&self) -> &'a [u8] {
        self.rest
    }

    pub fn is_finished(&self) -> bool {
        self.rest.is_empty()
    }

    /// Takes the next `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.rest.len() {
            return Err(DecodeError::EndOfStream {
                needed: len,
                available: self.rest.len(),
            });
        }
        let (taken, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(taken)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    /// Takes everything left.
    pub fn take_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.rest)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    pub fn read_var_int(&mut self) -> Result<i32> {
        Ok(self.read_var_int_with_size()?.0)
    }

    /// Reads a VarInt along with the number of bytes it took.
    pub fn read_var_int_with_size(&mut self) -> Result<(i32, usize)> {
        let mut value = 0u32;
        for (index, shift) in (0..32).step_by(7).enumerate() {
            let byte = self.read_u8()?;
            // Bits beyond the 32nd are dropped, as the vanilla client does.
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok((bytemuck::cast(value), index + 1));
            }
        }
        Err(DecodeError::VarIntTooLong)
    }

    /// A VarInt length followed by that many bytes.
    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.read_var_int()?)?;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<&'a str> {
        let bytes = self.read_byte_array()?;
        if bytes.len() > MAX_STRING_BYTES {
            return Err(DecodeError::StringTooLong);
        }
        let text = std::str::from_utf8(bytes)?;
        match text.chars().count() {
            n if n > MAX_STRING_CHARS => Err(DecodeError::StringTooLong),
            _ => Ok(text),
        }
    }
}

impl Decode for bool {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_bool()
    }
}

impl Decode for String {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(decoder.read_string()?.to_owned())
    }
}

impl Decode for Uuid {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_u128().map(Uuid::from_u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(bytes: &[u8]) -> Decoder<'_> {
        Decoder::new(bytes, ProtocolVersion::LATEST)
    }

    #[test]
    fn var_int_table() {
        let cases: &[(&[u8], i32)] = &[
            (&[0x00], 0),
            (&[0x01], 1),
            (&[0x7f], 127),
            (&[0x80, 0x01], 128),
            (&[0xff, 0x01], 255),
            (&[0xdd, 0xc7, 0x01], 25565),
            (&[0xff, 0xff, 0x7f], 2097151),
            (&[0xff, 0xff, 0xff, 0xff, 0x07], i32::MAX),
            (&[0xff, 0xff, 0xff, 0xff, 0x0f], -1),
            (&[0x80, 0x80, 0x80, 0x80, 0x08], i32::MIN),
        ];
        for (bytes, expected) in cases {
            let mut decoder = decoder(bytes);
            assert_eq!(
                decoder.read_var_int_with_size().unwrap(),
                (*expected, bytes.len())
            );
            assert!(decoder.is_finished());
        }
    }

    #[test]
    fn var_int_longer_than_five_bytes_is_rejected() {
        let mut decoder = decoder(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(
            decoder.read_var_int(),
            Err(DecodeError::VarIntTooLong)
        ));
    }

    #[test]
    fn truncated_input_reports_end_of_stream() {
        let mut decoder = decoder(&[0x00, 0x01]);
        assert!(matches!(
            decoder.read_i32(),
            Err(DecodeError::EndOfStream {
                needed: 4,
                available: 2
            })
        ));
    }

    #[test]
    fn strings() {
        let mut decoder = decoder(&[0x05, b'h', b'e', b'l', b'l', b'o', 0x02, 0xff, 0xfe]);
        assert_eq!(decoder.read_string().unwrap(), "hello");
        assert!(matches!(decoder.read_string(), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn invalid_bool() {
        assert!(matches!(
            decoder(&[0x02]).read_bool(),
            Err(DecodeError::InvalidBool(2))
        ));
    }

    #[test]
    fn take_rest_empties_the_decoder() {
        let mut decoder = decoder(&[1, 2, 3]);
        assert_eq!(decoder.read_u8().unwrap(), 1);
        assert_eq!(decoder.take_rest(), [2, 3]);
        assert!(decoder.is_finished());
    }
}
