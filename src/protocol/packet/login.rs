use crate::protocol::{
    decoder, Capability, Decode, Decoder, Encode, Encoder, ProtocolVersion,
};
use minecraft_relay_macros::{Decode, Encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serverbound. Name and, on newer versions, the client's idea of its UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub username: String,
    /// Optional on 1.19.3 - 1.20.1, required from 1.20.2.
    pub uuid: Option<Uuid>,
}

impl Encode for LoginStart {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_string(&self.username);
        let version = encoder.version();
        if version >= ProtocolVersion::V1_20_2 {
            self.uuid.unwrap_or_default().encode(encoder);
        } else if version >= ProtocolVersion::V1_19_3 {
            encoder.write_bool(self.uuid.is_some());
            if let Some(uuid) = &self.uuid {
                uuid.encode(encoder);
            }
        }
    }
}

impl Decode for LoginStart {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let username = String::decode(decoder)?;
        let version = decoder.version();
        let uuid = if version >= ProtocolVersion::V1_20_2 {
            Some(Uuid::decode(decoder)?)
        } else if version >= ProtocolVersion::V1_19_3 && decoder.read_bool()? {
            Some(Uuid::decode(decoder)?)
        } else {
            None
        };
        Ok(Self { username, uuid })
    }
}

/// Clientbound. Starts the key exchange.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EncryptionRequest {
    pub server_id: String,
    #[encoding(length_prefix = "varint")]
    pub public_key: Vec<u8>,
    #[encoding(length_prefix = "varint")]
    pub verify_token: Vec<u8>,
    #[encoding(since = 766)]
    pub should_authenticate: bool,
}

/// Serverbound. Shared secret and verify token, both RSA-encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EncryptionResponse {
    #[encoding(length_prefix = "varint")]
    pub shared_secret: Vec<u8>,
    #[encoding(length_prefix = "varint")]
    pub verify_token: Vec<u8>,
}

/// A signed property of a game profile, such as the skin texture.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ProfileProperty {
    pub name: String,
    pub value: String,
    #[encoding(bool_prefixed)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Clientbound. Ends the Login state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub uuid: Uuid,
    pub username: String,
    pub properties: Vec<ProfileProperty>,
    /// Only on the wire for 1.20.5 and 1.21.
    pub strict_error_handling: bool,
}

impl Encode for LoginSuccess {
    fn encode(&self, encoder: &mut Encoder) {
        let version = encoder.version();
        if version.supports(Capability::BinaryProfileUuid) {
            self.uuid.encode(encoder);
        } else {
            encoder.write_string(&self.uuid.hyphenated().to_string());
        }
        encoder.write_string(&self.username);
        if version.supports(Capability::ProfileProperties) {
            encoder.write_var_int(self.properties.len().try_into().unwrap_or(i32::MAX));
            for property in &self.properties {
                property.encode(encoder);
            }
        }
        if version.in_range(Some(766), Some(768)) {
            encoder.write_bool(self.strict_error_handling);
        }
    }
}

impl Decode for LoginSuccess {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let version = decoder.version();
        let uuid = if version.supports(Capability::BinaryProfileUuid) {
            Uuid::decode(decoder)?
        } else {
            Uuid::parse_str(decoder.read_string()?).map_err(anyhow::Error::from)?
        };
        let username = String::decode(decoder)?;
        let mut properties = Vec::new();
        if version.supports(Capability::ProfileProperties) {
            let count = usize::try_from(decoder.read_var_int()?)?;
            for _ in 0..count {
                properties.push(ProfileProperty::decode(decoder)?);
            }
        }
        let strict_error_handling = if version.in_range(Some(766), Some(768)) {
            decoder.read_bool()?
        } else {
            false
        };
        Ok(Self {
            uuid,
            username,
            properties,
            strict_error_handling,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SetCompression {
    #[encoding(varint)]
    pub threshold: i32,
}

/// Login-state disconnect. The reason is always a JSON text component,
/// even on versions that use NBT components elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LoginDisconnect {
    pub reason: String,
}

impl LoginDisconnect {
    pub fn text(message: &str) -> Self {
        Self {
            reason: serde_json::json!({ "text": message }).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LoginPluginRequest {
    #[encoding(varint)]
    pub message_id: i32,
    pub channel: String,
    #[encoding(length_prefix = "inferred")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LoginPluginResponse {
    #[encoding(varint)]
    pub message_id: i32,
    pub successful: bool,
    #[encoding(length_prefix = "inferred")]
    pub data: Vec<u8>,
}

/// Serverbound, 1.20.2+. The client has switched to the Configuration state.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LoginAcknowledged;
