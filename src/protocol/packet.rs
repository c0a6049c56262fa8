//! Typed packets the proxy inspects.
//!
//! Only packets the proxy needs to understand are decoded; every other
//! packet in the Configuration and Play states travels as a [`RawPacket`].
//! Which id a packet has depends on the version and state and is looked up
//! in the [`PacketRegistry`](super::PacketRegistry).

use crate::protocol::{Decode, DecodeError, Decoder, Encode, Encoder};
use bytes::Bytes;
use minecraft_relay_macros::FromVariants;

pub mod common;
pub mod component;
pub mod handshake;
pub mod login;
pub mod play;
pub mod status;

pub use common::{
    ChatMode, ClientSettings, Disconnect, FinishConfiguration, KeepAlive, MainHand,
    ParticleStatus, PluginMessage, SkinParts,
};
pub use component::Component;
pub use handshake::{Handshake, HandshakeIntent};
pub use login::{
    EncryptionRequest, EncryptionResponse, LoginAcknowledged, LoginDisconnect,
    LoginPluginRequest, LoginPluginResponse, LoginStart, LoginSuccess, ProfileProperty,
    SetCompression,
};
pub use play::{AcknowledgeConfiguration, JoinGame, StartConfiguration};
pub use status::{StatusPing, StatusRequest, StatusResponse};

#[derive(Debug, Clone, PartialEq, Eq, FromVariants, strum::EnumDiscriminants)]
#[strum_discriminants(name(PacketKind))]
#[strum_discriminants(derive(Hash, strum::AsRefStr, strum::EnumIter))]
pub enum Packet {
    Handshake(Handshake),
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
    StatusPing(StatusPing),
    LoginStart(LoginStart),
    EncryptionRequest(EncryptionRequest),
    EncryptionResponse(EncryptionResponse),
    LoginSuccess(LoginSuccess),
    SetCompression(SetCompression),
    LoginDisconnect(LoginDisconnect),
    LoginPluginRequest(LoginPluginRequest),
    LoginPluginResponse(LoginPluginResponse),
    LoginAcknowledged(LoginAcknowledged),
    ClientSettings(ClientSettings),
    PluginMessage(PluginMessage),
    KeepAlive(KeepAlive),
    Disconnect(Disconnect),
    FinishConfiguration(FinishConfiguration),
    JoinGame(JoinGame),
    StartConfiguration(StartConfiguration),
    AcknowledgeConfiguration(AcknowledgeConfiguration),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        PacketKind::from(self)
    }
}

impl Encode for Packet {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            Packet::Handshake(p) => p.encode(encoder),
            Packet::StatusRequest(p) => p.encode(encoder),
            Packet::StatusResponse(p) => p.encode(encoder),
            Packet::StatusPing(p) => p.encode(encoder),
            Packet::LoginStart(p) => p.encode(encoder),
            Packet::EncryptionRequest(p) => p.encode(encoder),
            Packet::EncryptionResponse(p) => p.encode(encoder),
            Packet::LoginSuccess(p) => p.encode(encoder),
            Packet::SetCompression(p) => p.encode(encoder),
            Packet::LoginDisconnect(p) => p.encode(encoder),
            Packet::LoginPluginRequest(p) => p.encode(encoder),
            Packet::LoginPluginResponse(p) => p.encode(encoder),
            Packet::LoginAcknowledged(p) => p.encode(encoder),
            Packet::ClientSettings(p) => p.encode(encoder),
            Packet::PluginMessage(p) => p.encode(encoder),
            Packet::KeepAlive(p) => p.encode(encoder),
            Packet::Disconnect(p) => p.encode(encoder),
            Packet::FinishConfiguration(p) => p.encode(encoder),
            Packet::JoinGame(p) => p.encode(encoder),
            Packet::StartConfiguration(p) => p.encode(encoder),
            Packet::AcknowledgeConfiguration(p) => p.encode(encoder),
        }
    }
}

/// Signature of the per-kind decode functions stored in the registry.
pub type DecodeFn = fn(&mut Decoder) -> Result<Packet, DecodeError>;

fn decode_as<T: Decode + Into<Packet>>(decoder: &mut Decoder) -> Result<Packet, DecodeError> {
    T::decode(decoder).map(Into::into)
}

impl PacketKind {
    /// The function that decodes this kind's payload.
    pub fn decode_fn(self) -> DecodeFn {
        match self {
            PacketKind::Handshake => decode_as::<Handshake>,
            PacketKind::StatusRequest => decode_as::<StatusRequest>,
            PacketKind::StatusResponse => decode_as::<StatusResponse>,
            PacketKind::StatusPing => decode_as::<StatusPing>,
            PacketKind::LoginStart => decode_as::<LoginStart>,
            PacketKind::EncryptionRequest => decode_as::<EncryptionRequest>,
            PacketKind::EncryptionResponse => decode_as::<EncryptionResponse>,
            PacketKind::LoginSuccess => decode_as::<LoginSuccess>,
            PacketKind::SetCompression => decode_as::<SetCompression>,
            PacketKind::LoginDisconnect => decode_as::<LoginDisconnect>,
            PacketKind::LoginPluginRequest => decode_as::<LoginPluginRequest>,
            PacketKind::LoginPluginResponse => decode_as::<LoginPluginResponse>,
            PacketKind::LoginAcknowledged => decode_as::<LoginAcknowledged>,
            PacketKind::ClientSettings => decode_as::<ClientSettings>,
            PacketKind::PluginMessage => decode_as::<PluginMessage>,
            PacketKind::KeepAlive => decode_as::<KeepAlive>,
            PacketKind::Disconnect => decode_as::<Disconnect>,
            PacketKind::FinishConfiguration => decode_as::<FinishConfiguration>,
            PacketKind::JoinGame => decode_as::<JoinGame>,
            PacketKind::StartConfiguration => decode_as::<StartConfiguration>,
            PacketKind::AcknowledgeConfiguration => decode_as::<AcknowledgeConfiguration>,
        }
    }
}

/// A packet the proxy did not decode: its id and the undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub id: i32,
    pub payload: Bytes,
}

/// The result of reading one packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPacket {
    Known(Packet),
    /// No codec is registered for the id in a state that forwards such packets.
    Opaque(RawPacket),
}

impl DecodedPacket {
    pub fn known(&self) -> Option<&Packet> {
        match self {
            DecodedPacket::Known(packet) => Some(packet),
            DecodedPacket::Opaque(_) => None,
        }
    }

    /// Short description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            DecodedPacket::Known(packet) => packet.kind().as_ref().to_owned(),
            DecodedPacket::Opaque(raw) => format!("packet {:#04x}", raw.id),
        }
    }
}

impl From<Packet> for DecodedPacket {
    fn from(packet: Packet) -> Self {
        DecodedPacket::Known(packet)
    }
}

impl From<RawPacket> for DecodedPacket {
    fn from(raw: RawPacket) -> Self {
        DecodedPacket::Opaque(raw)
    }
}
