//! Protocol version numbers and the capability table that decides
//! which wire shapes apply to a given version.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A Minecraft Java protocol version number.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProtocolVersion(i32);

impl ProtocolVersion {
    pub const V1_8: Self = Self(47);
    pub const V1_9: Self = Self(107);
    pub const V1_12_2: Self = Self(340);
    pub const V1_13: Self = Self(393);
    pub const V1_16: Self = Self(735);
    pub const V1_16_4: Self = Self(754);
    pub const V1_17: Self = Self(755);
    pub const V1_18: Self = Self(757);
    pub const V1_18_2: Self = Self(758);
    pub const V1_19: Self = Self(759);
    pub const V1_19_3: Self = Self(761);
    pub const V1_19_4: Self = Self(762);
    pub const V1_20: Self = Self(763);
    pub const V1_20_2: Self = Self(764);
    pub const V1_20_3: Self = Self(765);
    pub const V1_20_5: Self = Self(766);
    pub const V1_21: Self = Self(767);
    pub const V1_21_2: Self = Self(768);
    pub const V1_21_4: Self = Self(769);

    /// Newest version the proxy speaks.
    pub const LATEST: Self = Self::V1_21_4;

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn id(self) -> i32 {
        self.0
    }

    /// Whether this version lies in `[since, until)`. A missing bound is open.
    pub fn in_range(self, since: Option<i32>, until: Option<i32>) -> bool {
        since.map_or(true, |since| self.0 >= since) && until.map_or(true, |until| self.0 < until)
    }

    pub fn supports(self, capability: Capability) -> bool {
        self >= capability.introduced_in()
    }

    /// Whether the proxy has packet tables for this exact version.
    pub fn is_known(self) -> bool {
        SUPPORTED_VERSIONS.contains(&self)
    }

    /// Release name shown in the server list, e.g. `1.20.4`.
    pub fn release_name(self) -> Option<&'static str> {
        let name = match self.0 {
            47 => "1.8.9",
            340 => "1.12.2",
            754 => "1.16.5",
            758 => "1.18.2",
            762 => "1.19.4",
            763 => "1.20.1",
            764 => "1.20.2",
            765 => "1.20.4",
            766 => "1.20.6",
            767 => "1.21.1",
            768 => "1.21.3",
            769 => "1.21.4",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.release_name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "protocol {}", self.0),
        }
    }
}

/// Every version with a complete packet table, oldest first.
pub const SUPPORTED_VERSIONS: &[ProtocolVersion] = &[
    ProtocolVersion::V1_8,
    ProtocolVersion::V1_12_2,
    ProtocolVersion::V1_16_4,
    ProtocolVersion::V1_18_2,
    ProtocolVersion::V1_19_4,
    ProtocolVersion::V1_20,
    ProtocolVersion::V1_20_2,
    ProtocolVersion::V1_20_3,
    ProtocolVersion::V1_20_5,
    ProtocolVersion::V1_21,
    ProtocolVersion::V1_21_2,
    ProtocolVersion::V1_21_4,
];

/// A protocol feature that appeared at some version and stayed.
///
/// Code that branches on the shape of the protocol asks the capability
/// table instead of comparing version numbers inline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::EnumIter, strum::AsRefStr)]
pub enum Capability {
    /// The Configuration state between Login and Play, and re-entry into it from Play.
    ConfigurationState,
    /// Login plugin request/response packets.
    LoginPluginMessages,
    /// Plugin channels are `namespace:path` identifiers.
    NamespacedChannels,
    /// Keep-alive ids are longs rather than varints.
    LongKeepAlive,
    /// Login success carries the UUID as 16 raw bytes.
    BinaryProfileUuid,
    /// Login success carries the profile properties.
    ProfileProperties,
    /// Chat components are sent as network NBT rather than JSON.
    NbtComponents,
    /// Handshake intent 3 (transfer) and the `should_authenticate` flag.
    TransferIntent,
}

impl Capability {
    pub const fn introduced_in(self) -> ProtocolVersion {
        match self {
            Capability::ConfigurationState => ProtocolVersion::V1_20_2,
            Capability::LoginPluginMessages => ProtocolVersion::V1_13,
            Capability::NamespacedChannels => ProtocolVersion::V1_13,
            Capability::LongKeepAlive => ProtocolVersion::V1_12_2,
            Capability::BinaryProfileUuid => ProtocolVersion::V1_16,
            Capability::ProfileProperties => ProtocolVersion::V1_19,
            Capability::NbtComponents => ProtocolVersion::V1_20_3,
            Capability::TransferIntent => ProtocolVersion::V1_20_5,
        }
    }
}
