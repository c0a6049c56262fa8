//! Packets that exist in both the Configuration and Play states
//! with the same shape.

use crate::protocol::{
    decoder, packet::component::Component, Capability, Decode, Decoder, Encode, Encoder,
    ProtocolVersion,
};
use bitflags::bitflags;
use minecraft_relay_macros::{Decode, Encode};

/// Keep-alive in either direction. The id is a varint before 1.12.2
/// and a long from then on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub id: i64,
}

impl Encode for KeepAlive {
    fn encode(&self, encoder: &mut Encoder) {
        if encoder.version().supports(Capability::LongKeepAlive) {
            encoder.write_i64(self.id);
        } else {
            encoder.write_var_int(self.id as i32);
        }
    }
}

impl Decode for KeepAlive {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let id = if decoder.version().supports(Capability::LongKeepAlive) {
            decoder.read_i64()?
        } else {
            i64::from(decoder.read_var_int()?)
        };
        Ok(Self { id })
    }
}

/// A custom payload on a named channel, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PluginMessage {
    pub channel: String,
    #[encoding(length_prefix = "inferred")]
    pub data: Vec<u8>,
}

impl PluginMessage {
    pub fn new(channel: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }
}

/// Clientbound disconnect outside of the Login state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: Component,
}

impl Encode for Disconnect {
    fn encode(&self, encoder: &mut Encoder) {
        self.reason.encode(encoder);
    }
}

impl Decode for Disconnect {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        Component::decode(decoder).map(|reason| Self { reason })
    }
}

/// Ends a configuration phase. Sent by the server, then echoed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FinishConfiguration;

bitflags! {
    /// Which parts of the skin the client displays.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct SkinParts: u8 {
        const CAPE = 0x01;
        const JACKET = 0x02;
        const LEFT_SLEEVE = 0x04;
        const RIGHT_SLEEVE = 0x08;
        const LEFT_PANTS = 0x10;
        const RIGHT_PANTS = 0x20;
        const HAT = 0x40;
    }
}

impl Default for SkinParts {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum ChatMode {
    #[default]
    Enabled,
    CommandsOnly,
    Hidden,
}

impl ChatMode {
    fn id(self) -> i32 {
        match self {
            ChatMode::Enabled => 0,
            ChatMode::CommandsOnly => 1,
            ChatMode::Hidden => 2,
        }
    }

    fn from_id(id: i32) -> decoder::Result<Self> {
        match id {
            0 => Ok(ChatMode::Enabled),
            1 => Ok(ChatMode::CommandsOnly),
            2 => Ok(ChatMode::Hidden),
            _ => Err(decoder::DecodeError::InvalidDiscriminant(id.into())),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
#[encoding(discriminant = "varint")]
pub enum MainHand {
    #[encoding(id = 0)]
    Left,
    #[default]
    #[encoding(id = 1)]
    Right,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
#[encoding(discriminant = "varint")]
pub enum ParticleStatus {
    #[default]
    #[encoding(id = 0)]
    All,
    #[encoding(id = 1)]
    Decreased,
    #[encoding(id = 2)]
    Minimal,
}

/// Serverbound client options. Stored per session so they can be
/// replayed to every backend the player is moved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub locale: String,
    pub view_distance: i8,
    pub chat_mode: ChatMode,
    pub chat_colors: bool,
    pub skin_parts: SkinParts,
    pub main_hand: MainHand,
    pub text_filtering: bool,
    pub allow_server_listings: bool,
    pub particle_status: ParticleStatus,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            locale: "en_us".into(),
            view_distance: 10,
            chat_mode: ChatMode::Enabled,
            chat_colors: true,
            skin_parts: SkinParts::default(),
            main_hand: MainHand::Right,
            text_filtering: false,
            allow_server_listings: true,
            particle_status: ParticleStatus::All,
        }
    }
}

impl Encode for ClientSettings {
    fn encode(&self, encoder: &mut Encoder) {
        let version = encoder.version();
        encoder.write_string(&self.locale);
        encoder.write_i8(self.view_distance);
        if version >= ProtocolVersion::V1_9 {
            encoder.write_var_int(self.chat_mode.id());
        } else {
            encoder.write_u8(self.chat_mode.id() as u8);
        }
        encoder.write_bool(self.chat_colors);
        encoder.write_u8(self.skin_parts.bits());
        if version >= ProtocolVersion::V1_9 {
            self.main_hand.encode(encoder);
        }
        if version >= ProtocolVersion::V1_17 {
            encoder.write_bool(self.text_filtering);
        }
        if version >= ProtocolVersion::V1_18 {
            encoder.write_bool(self.allow_server_listings);
        }
        if version >= ProtocolVersion::V1_21_2 {
            self.particle_status.encode(encoder);
        }
    }
}

impl Decode for ClientSettings {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let version = decoder.version();
        let defaults = Self::default();
        let locale = String::decode(decoder)?;
        let view_distance = decoder.read_i8()?;
        let chat_mode = if version >= ProtocolVersion::V1_9 {
            ChatMode::from_id(decoder.read_var_int()?)?
        } else {
            ChatMode::from_id(decoder.read_u8()?.into())?
        };
        let chat_colors = decoder.read_bool()?;
        let skin_parts = SkinParts::from_bits_truncate(decoder.read_u8()?);
        let main_hand = if version >= ProtocolVersion::V1_9 {
            MainHand::decode(decoder)?
        } else {
            defaults.main_hand
        };
        let text_filtering = if version >= ProtocolVersion::V1_17 {
            decoder.read_bool()?
        } else {
            defaults.text_filtering
        };
        let allow_server_listings = if version >= ProtocolVersion::V1_18 {
            decoder.read_bool()?
        } else {
            defaults.allow_server_listings
        };
        let particle_status = if version >= ProtocolVersion::V1_21_2 {
            ParticleStatus::decode(decoder)?
        } else {
            defaults.particle_status
        };
        Ok(Self {
            locale,
            view_distance,
            chat_mode,
            chat_colors,
            skin_parts,
            main_hand,
            text_filtering,
            allow_server_listings,
            particle_status,
        })
    }
}
