use crate::protocol::ProtocolVersion;
use uuid::Uuid;

/// Appends the wire form of values to a byte buffer.
///
/// Whatever `out` already holds is kept; the encoder only ever appends.
#[derive(Debug)]
pub struct Encoder<'a> {
    out: &'a mut Vec<u8>,
    version: ProtocolVersion,
}

/// A value with a wire form.
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);
}

/// Big-endian fixed-width integers: one `write_*` method each, plus the
/// matching `Encode` impl.
macro_rules! fixed_width {
    ($($method:ident => $ty:ty),* $(,)?) => {
        impl Encoder<'_> {
            $(
                pub fn $method(&mut self, value: $ty) {
                    self.out.extend_from_slice(&value.to_be_bytes());
                }
            )*
        }

        $(
            impl Encode for $ty {
                fn encode(&self, encoder: &mut Encoder) {
                    encoder.$method(*self);
                }
            }
        )*
    };
}

fixed_width! {
    write_u8 => u8,
    write_i8 => i8,
    write_u16 => u16,
    write_i16 => i16,
    write_i32 => i32,
    write_i64 => i64,
    write_u128 => u128,
}

impl<'a> Encoder<'a> {
    pub fn new(out: &'a mut Vec<u8>, version: ProtocolVersion) -> Self {
        Self { out, version }
    }

    /// The version whose wire shape is being written.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Raw bytes, without a length prefix.
    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Writes `value` as a VarInt and returns its encoded size.
    ///
    /// Negative values take all five bytes.
    pub fn write_var_int(&mut self, value: i32) -> usize {
        let mut rest: u32 = bytemuck::cast(value);
        let mut scratch = [0u8; 5];
        let mut len = 0;
        while len == 0 || rest != 0 {
            let low = (rest & 0x7f) as u8;
            rest >>= 7;
            scratch[len] = if rest == 0 { low } else { low | 0x80 };
            len += 1;
        }
        self.write_slice(&scratch[..len]);
        len
    }

    /// Bytes preceded by their VarInt length.
    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.write_var_int(i32::try_from(bytes.len()).unwrap_or(i32::MAX));
        self.write_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_array(value.as_bytes());
    }
}

impl Encode for bool {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_bool(*self);
    }
}

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_string(self);
    }
}

impl Encode for Uuid {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u128(self.as_u128());
    }
}
