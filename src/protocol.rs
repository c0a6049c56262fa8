//! The Minecraft wire protocol: byte-level codecs, the per-version packet
//! registry and the connection state machine.

mod cipher;
mod codec;
mod compression;
mod decoder;
mod encoder;
mod frame;
pub mod packet;
mod registry;
mod state;
mod version;

pub use cipher::{CipherError, Decryptor, EncryptionKey, Encryptor};
pub use codec::{CodecError, InboundCodec, OutboundCodec, PacketCodec};
pub use compression::{compress, decompress, CompressionError, CompressionThreshold};
pub use decoder::{Decode, DecodeError, Decoder};
pub use encoder::{Encode, Encoder};
pub use frame::{encode_frame, var_int_size, FrameDecoder, FrameError, Frames};
pub use packet::{DecodedPacket, Packet, PacketKind, RawPacket};
pub use registry::{PacketRegistry, RegistryError};
pub use state::{ConnectionState, Direction, StateCell};
pub use version::{Capability, ProtocolVersion, SUPPORTED_VERSIONS};

/// Largest frame the protocol allows: the biggest value a
/// three-byte varint can hold.
pub const MAX_FRAME_LENGTH: usize = (1 << 21) - 1;

/// A violation of the protocol that leaves the stream unusable.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("illegal state transition {from} -> {to} for {version}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
        version: ProtocolVersion,
    },
    #[error("packet id {id:#04x} is not valid in {state} ({direction}) for {version}")]
    UnknownPacket {
        id: i32,
        state: ConnectionState,
        direction: Direction,
        version: ProtocolVersion,
    },
    #[error("{kind:?} cannot be sent in {state} ({direction}) for {version}")]
    Unencodable {
        kind: PacketKind,
        state: ConnectionState,
        direction: Direction,
        version: ProtocolVersion,
    },
    #[error("failed to decode {kind:?}: {source}")]
    Decode {
        kind: PacketKind,
        #[source]
        source: DecodeError,
    },
    #[error("{remaining} unread bytes after {kind:?}")]
    TrailingBytes { kind: PacketKind, remaining: usize },
    #[error("unexpected {got} while waiting for {expected}")]
    UnexpectedPacket { expected: &'static str, got: String },
    #[error("handshake intent {intent} is not available in {version}")]
    UnsupportedIntent { intent: i32, version: ProtocolVersion },
    #[error("malformed packet header: {0}")]
    Header(#[source] DecodeError),
}
