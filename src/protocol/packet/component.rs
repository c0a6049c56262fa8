//! Chat components as they appear in disconnect packets: JSON text
//! before 1.20.3, network NBT from then on.
//!
//! The proxy only builds plain-text components and reads the text back
//! out of components it receives; everything else is carried opaquely.

use crate::protocol::{decoder, Capability, Decode, Decoder, Encode, Encoder, ProtocolVersion};

const TAG_END: u8 = 0x00;
const TAG_STRING: u8 = 0x08;
const TAG_COMPOUND: u8 = 0x0a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    /// A JSON-serialized component.
    Json(String),
    /// A single unnamed network NBT tag, kept as raw bytes.
    Nbt(Vec<u8>),
}

impl Component {
    /// A plain-text component in the representation `version` expects.
    pub fn text(message: &str, version: ProtocolVersion) -> Self {
        if version.supports(Capability::NbtComponents) {
            let mut nbt = vec![TAG_COMPOUND, TAG_STRING];
            write_nbt_string(&mut nbt, "text");
            write_nbt_string(&mut nbt, message);
            nbt.push(TAG_END);
            Component::Nbt(nbt)
        } else {
            Component::Json(serde_json::json!({ "text": message }).to_string())
        }
    }

    /// Best-effort plain text of the component, for logs and hook callbacks.
    pub fn plain_text(&self) -> String {
        match self {
            Component::Json(json) => match serde_json::from_str::<serde_json::Value>(json) {
                Ok(value) => json_text(&value),
                Err(_) => json.clone(),
            },
            Component::Nbt(nbt) => nbt_text(nbt).unwrap_or_default(),
        }
    }
}

impl Encode for Component {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            Component::Json(json) => encoder.write_string(json),
            Component::Nbt(nbt) => encoder.write_slice(nbt),
        }
    }
}

impl Decode for Component {
    /// NBT components are always the last field of the packets
    /// the proxy decodes them in, so the rest of the body is taken.
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        if decoder.version().supports(Capability::NbtComponents) {
            Ok(Component::Nbt(decoder.take_rest().to_vec()))
        } else {
            String::decode(decoder).map(Component::Json)
        }
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Array(parts) => parts.iter().map(json_text).collect(),
        serde_json::Value::Object(object) => {
            let mut text = object
                .get("text")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if text.is_empty() {
                if let Some(key) = object.get("translate").and_then(serde_json::Value::as_str) {
                    text.push_str(key);
                }
            }
            if let Some(serde_json::Value::Array(extra)) = object.get("extra") {
                text.extend(extra.iter().map(json_text));
            }
            text
        }
        _ => String::new(),
    }
}

/// Renders a network NBT component the same way as its JSON form. A
/// component with no `text`, `translate` or `extra` falls back to its
/// first string anywhere.
fn nbt_text(nbt: &[u8]) -> Option<String> {
    let (&tag, rest) = nbt.split_first()?;
    let value = NbtReader { input: rest }.value(tag, 0)?;
    let text = json_text(&value);
    if text.is_empty() {
        first_string(&value).map(str::to_owned)
    } else {
        Some(text)
    }
}

fn first_string(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(text) => Some(text),
        serde_json::Value::Array(items) => items.iter().find_map(first_string),
        serde_json::Value::Object(object) => object.values().find_map(first_string),
        _ => None,
    }
}

/// Nesting limit for NBT, as enforced by the vanilla client.
const MAX_NBT_DEPTH: usize = 512;

const TAG_BYTE: u8 = 0x01;
const TAG_SHORT: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_LONG: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_DOUBLE: u8 = 0x06;
const TAG_BYTE_ARRAY: u8 = 0x07;
const TAG_LIST: u8 = 0x09;
const TAG_INT_ARRAY: u8 = 0x0b;
const TAG_LONG_ARRAY: u8 = 0x0c;

/// Reads NBT payloads into JSON values. `None` means the data is malformed.
struct NbtReader<'a> {
    input: &'a [u8],
}

impl<'a> NbtReader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.input.get(..N)?.try_into().ok()?;
        self.input = &self.input[N..];
        Some(bytes)
    }

    /// Reads an i32 length, refusing counts the remaining input cannot hold.
    fn length(&mut self, element_size: usize) -> Option<usize> {
        let length = usize::try_from(i32::from_be_bytes(self.take()?)).unwrap_or(0);
        (length.checked_mul(element_size)? <= self.input.len()).then_some(length)
    }

    fn value(&mut self, tag: u8, depth: usize) -> Option<serde_json::Value> {
        use serde_json::Value;
        if depth > MAX_NBT_DEPTH {
            return None;
        }
        let value = match tag {
            TAG_BYTE => Value::from(i8::from_be_bytes(self.take()?)),
            TAG_SHORT => Value::from(i16::from_be_bytes(self.take()?)),
            TAG_INT => Value::from(i32::from_be_bytes(self.take()?)),
            TAG_LONG => Value::from(i64::from_be_bytes(self.take()?)),
            TAG_FLOAT => Value::from(f64::from(f32::from_be_bytes(self.take()?))),
            TAG_DOUBLE => Value::from(f64::from_be_bytes(self.take()?)),
            TAG_BYTE_ARRAY => self.array(1, TAG_BYTE)?,
            TAG_INT_ARRAY => self.array(4, TAG_INT)?,
            TAG_LONG_ARRAY => self.array(8, TAG_LONG)?,
            TAG_STRING => Value::String(read_nbt_string(&mut self.input)?),
            TAG_LIST => {
                let [element] = self.take()?;
                let length = self.length(1)?;
                if element == TAG_END {
                    Value::Array(Vec::new())
                } else {
                    (0..length)
                        .map(|_| self.value(element, depth + 1))
                        .collect::<Option<_>>()?
                }
            }
            TAG_COMPOUND => {
                let mut object = serde_json::Map::new();
                loop {
                    let [tag] = self.take()?;
                    if tag == TAG_END {
                        break;
                    }
                    let name = read_nbt_string(&mut self.input)?;
                    object.insert(name, self.value(tag, depth + 1)?);
                }
                Value::Object(object)
            }
            _ => return None,
        };
        Some(value)
    }

    fn array(&mut self, element_size: usize, element: u8) -> Option<serde_json::Value> {
        let length = self.length(element_size)?;
        (0..length).map(|_| self.value(element, 0)).collect()
    }
}

fn write_nbt_string(out: &mut Vec<u8>, value: &str) {
    let bytes = encode_modified_utf8(value);
    let length = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    out.extend(length.to_be_bytes());
    out.extend_from_slice(&bytes[..usize::from(length)]);
}

fn read_nbt_string(input: &mut &[u8]) -> Option<String> {
    if input.len() < 2 {
        return None;
    }
    let length = usize::from(u16::from_be_bytes([input[0], input[1]]));
    let bytes = input.get(2..2 + length)?;
    *input = &input[2 + length..];
    decode_modified_utf8(bytes)
}

/// Java's modified UTF-8: NUL takes two bytes and characters outside the
/// basic multilingual plane are written as a surrogate pair.
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let (unit, width) = if b & 0x80 == 0 {
            (u16::from(b), 1)
        } else if b & 0xe0 == 0xc0 {
            let b2 = *bytes.get(i + 1)?;
            ((u16::from(b & 0x1f) << 6) | u16::from(b2 & 0x3f), 2)
        } else if b & 0xf0 == 0xe0 {
            let b2 = *bytes.get(i + 1)?;
            let b3 = *bytes.get(i + 2)?;
            (
                (u16::from(b & 0x0f) << 12) | (u16::from(b2 & 0x3f) << 6) | u16::from(b3 & 0x3f),
                3,
            )
        } else {
            return None;
        };
        units.push(unit);
        i += width;
    }
    String::from_utf16(&units).ok()
}
