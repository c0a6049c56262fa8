//! The versioned packet registry.
//!
//! Packet ids are declared once per packet kind as a list of mappings, each
//! valid from a version until the next mapping takes over (or until an
//! explicit end, which leaves a gap). At start-up the declarations are
//! expanded into one id table per (version, state, direction). The result
//! is immutable and shared by every connection.

use crate::protocol::{
    packet::DecodeFn, ConnectionState, DecodedPacket, Decoder, Direction, Encoder, Packet,
    PacketKind, ProtocolError, ProtocolVersion, RawPacket, SUPPORTED_VERSIONS,
};
use ahash::AHashMap;
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no packet tables for {0}")]
    UnsupportedVersion(ProtocolVersion),
    #[error("{first:?} and {second:?} both map to id {id:#04x} in {state} ({direction}) for {version}")]
    DuplicateId {
        id: i32,
        first: PacketKind,
        second: PacketKind,
        state: ConnectionState,
        direction: Direction,
        version: ProtocolVersion,
    },
    #[error("no packet {id:#04x} in {state} ({direction}) for {version}")]
    NotFound {
        id: i32,
        state: ConnectionState,
        direction: Direction,
        version: ProtocolVersion,
    },
}

/// One id assignment, valid from `from` until the next mapping or `until`.
#[derive(Copy, Clone, Debug)]
struct Mapping {
    id: i32,
    from: ProtocolVersion,
    until: Option<ProtocolVersion>,
}

const fn at(id: i32, from: ProtocolVersion) -> Mapping {
    Mapping {
        id,
        from,
        until: None,
    }
}

#[cfg(test)]
const fn between(id: i32, from: ProtocolVersion, until: ProtocolVersion) -> Mapping {
    Mapping {
        id,
        from,
        until: Some(until),
    }
}

/// Where a packet kind lives and which ids it has had.
struct Declaration {
    kind: PacketKind,
    state: ConnectionState,
    direction: Direction,
    mappings: &'static [Mapping],
}

impl Declaration {
    /// The id in effect for `version`, if the packet exists there.
    fn id_for(&self, version: ProtocolVersion) -> Option<i32> {
        let index = self
            .mappings
            .iter()
            .rposition(|mapping| mapping.from <= version)?;
        let mapping = self.mappings[index];
        match mapping.until {
            Some(until) if version >= until => None,
            _ => Some(mapping.id),
        }
    }
}

use ConnectionState::{Configuration, Handshake, Login, Play, Status};
use Direction::{Clientbound, Serverbound};
use ProtocolVersion as V;

macro_rules! declare {
    ($($kind:ident in $state:ident $direction:ident: [$($mapping:expr),+ $(,)?];)*) => {
        &[$(Declaration {
            kind: PacketKind::$kind,
            state: $state,
            direction: $direction,
            mappings: &[$($mapping),+],
        }),*]
    };
}

static DECLARATIONS: &[Declaration] = declare! {
    Handshake in Handshake Serverbound: [at(0x00, V::V1_8)];

    StatusRequest in Status Serverbound: [at(0x00, V::V1_8)];
    StatusPing in Status Serverbound: [at(0x01, V::V1_8)];
    StatusResponse in Status Clientbound: [at(0x00, V::V1_8)];
    StatusPing in Status Clientbound: [at(0x01, V::V1_8)];

    LoginStart in Login Serverbound: [at(0x00, V::V1_8)];
    EncryptionResponse in Login Serverbound: [at(0x01, V::V1_8)];
    LoginPluginResponse in Login Serverbound: [at(0x02, V::V1_13)];
    LoginAcknowledged in Login Serverbound: [at(0x03, V::V1_20_2)];
    LoginDisconnect in Login Clientbound: [at(0x00, V::V1_8)];
    EncryptionRequest in Login Clientbound: [at(0x01, V::V1_8)];
    LoginSuccess in Login Clientbound: [at(0x02, V::V1_8)];
    SetCompression in Login Clientbound: [at(0x03, V::V1_8)];
    LoginPluginRequest in Login Clientbound: [at(0x04, V::V1_13)];

    ClientSettings in Configuration Serverbound: [at(0x00, V::V1_20_2)];
    PluginMessage in Configuration Serverbound: [at(0x01, V::V1_20_2), at(0x02, V::V1_20_5)];
    FinishConfiguration in Configuration Serverbound: [at(0x02, V::V1_20_2), at(0x03, V::V1_20_5)];
    KeepAlive in Configuration Serverbound: [at(0x03, V::V1_20_2), at(0x04, V::V1_20_5)];
    PluginMessage in Configuration Clientbound: [at(0x00, V::V1_20_2), at(0x01, V::V1_20_5)];
    Disconnect in Configuration Clientbound: [at(0x01, V::V1_20_2), at(0x02, V::V1_20_5)];
    FinishConfiguration in Configuration Clientbound: [at(0x02, V::V1_20_2), at(0x03, V::V1_20_5)];
    KeepAlive in Configuration Clientbound: [at(0x03, V::V1_20_2), at(0x04, V::V1_20_5)];

    KeepAlive in Play Serverbound: [
        at(0x00, V::V1_8),
        at(0x0b, V::V1_12_2),
        at(0x10, V::V1_16_4),
        at(0x0f, V::V1_18_2),
        at(0x12, V::V1_19_4),
        at(0x14, V::V1_20_2),
        at(0x15, V::V1_20_3),
        at(0x18, V::V1_20_5),
        at(0x1a, V::V1_21_2),
        at(0x1b, V::V1_21_4),
    ];
    PluginMessage in Play Serverbound: [
        at(0x17, V::V1_8),
        at(0x09, V::V1_12_2),
        at(0x0b, V::V1_16_4),
        at(0x0a, V::V1_18_2),
        at(0x0d, V::V1_19_4),
        at(0x0f, V::V1_20_2),
        at(0x10, V::V1_20_3),
        at(0x12, V::V1_20_5),
        at(0x14, V::V1_21_2),
        at(0x15, V::V1_21_4),
    ];
    ClientSettings in Play Serverbound: [
        at(0x15, V::V1_8),
        at(0x04, V::V1_12_2),
        at(0x05, V::V1_16_4),
        at(0x08, V::V1_19_4),
        at(0x09, V::V1_20_2),
        at(0x0a, V::V1_20_5),
        at(0x0c, V::V1_21_2),
    ];
    AcknowledgeConfiguration in Play Serverbound: [
        at(0x0b, V::V1_20_2),
        at(0x0c, V::V1_20_5),
        at(0x0e, V::V1_21_2),
    ];

    KeepAlive in Play Clientbound: [
        at(0x00, V::V1_8),
        at(0x1f, V::V1_12_2),
        at(0x21, V::V1_18_2),
        at(0x23, V::V1_19_4),
        at(0x24, V::V1_20_2),
        at(0x26, V::V1_20_5),
        at(0x27, V::V1_21_2),
    ];
    Disconnect in Play Clientbound: [
        at(0x40, V::V1_8),
        at(0x1a, V::V1_12_2),
        at(0x19, V::V1_16_4),
        at(0x1a, V::V1_18_2),
        at(0x1b, V::V1_20_2),
        at(0x1d, V::V1_20_5),
    ];
    PluginMessage in Play Clientbound: [
        at(0x3f, V::V1_8),
        at(0x18, V::V1_12_2),
        at(0x17, V::V1_16_4),
        at(0x18, V::V1_18_2),
        at(0x17, V::V1_19_4),
        at(0x18, V::V1_20_2),
        at(0x19, V::V1_20_5),
    ];
    JoinGame in Play Clientbound: [
        at(0x01, V::V1_8),
        at(0x23, V::V1_12_2),
        at(0x24, V::V1_16_4),
        at(0x26, V::V1_18_2),
        at(0x28, V::V1_19_4),
        at(0x29, V::V1_20_2),
        at(0x2b, V::V1_20_5),
        at(0x2c, V::V1_21_2),
    ];
    StartConfiguration in Play Clientbound: [
        at(0x65, V::V1_20_2),
        at(0x67, V::V1_20_3),
        at(0x69, V::V1_20_5),
        at(0x70, V::V1_21_2),
    ];
};

/// What the registry knows about one packet id.
#[derive(Copy, Clone)]
pub struct RegistryEntry {
    pub kind: PacketKind,
    pub decode: DecodeFn,
}

#[derive(Default)]
struct StateTable {
    by_id: AHashMap<i32, RegistryEntry>,
    by_kind: AHashMap<PacketKind, i32>,
}

type TableKey = (ProtocolVersion, ConnectionState, Direction);

pub struct PacketRegistry {
    tables: AHashMap<TableKey, StateTable>,
    versions: Vec<ProtocolVersion>,
}

static GLOBAL: Lazy<Arc<PacketRegistry>> = Lazy::new(|| {
    let registry = PacketRegistry::from_declarations(SUPPORTED_VERSIONS, DECLARATIONS)
        .unwrap_or_else(|e| panic!("built-in packet declarations are inconsistent: {e}"));
    Arc::new(registry)
});

impl PacketRegistry {
    /// Builds the tables for `versions`.
    pub fn new(versions: &[ProtocolVersion]) -> Result<Self, RegistryError> {
        Self::from_declarations(versions, DECLARATIONS)
    }

    /// The registry for every supported version, built on first use.
    pub fn global() -> Arc<PacketRegistry> {
        Arc::clone(&GLOBAL)
    }

    fn from_declarations(
        versions: &[ProtocolVersion],
        declarations: &[Declaration],
    ) -> Result<Self, RegistryError> {
        let mut tables: AHashMap<TableKey, StateTable> = AHashMap::new();
        for &version in versions {
            if !version.is_known() {
                return Err(RegistryError::UnsupportedVersion(version));
            }
            for declaration in declarations {
                let Some(id) = declaration.id_for(version) else {
                    continue;
                };
                let table = tables
                    .entry((version, declaration.state, declaration.direction))
                    .or_default();
                let entry = RegistryEntry {
                    kind: declaration.kind,
                    decode: declaration.kind.decode_fn(),
                };
                if let Some(existing) = table.by_id.insert(id, entry) {
                    return Err(RegistryError::DuplicateId {
                        id,
                        first: existing.kind,
                        second: declaration.kind,
                        state: declaration.state,
                        direction: declaration.direction,
                        version,
                    });
                }
                table.by_kind.insert(declaration.kind, id);
            }
        }

        let mut versions = versions.to_vec();
        versions.sort();
        versions.dedup();
        Ok(Self { tables, versions })
    }

    /// Versions this registry has tables for.
    pub fn versions(&self) -> &[ProtocolVersion] {
        &self.versions
    }

    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.versions.binary_search(&version).is_ok()
    }

    /// Looks up the codec for a packet id.
    pub fn resolve(
        &self,
        version: ProtocolVersion,
        state: ConnectionState,
        direction: Direction,
        id: i32,
    ) -> Result<&RegistryEntry, RegistryError> {
        self.tables
            .get(&(version, state, direction))
            .and_then(|table| table.by_id.get(&id))
            .ok_or(RegistryError::NotFound {
                id,
                state,
                direction,
                version,
            })
    }

    /// The id a packet kind has for `version` in `state`, if it exists there.
    pub fn packet_id(
        &self,
        version: ProtocolVersion,
        state: ConnectionState,
        direction: Direction,
        kind: PacketKind,
    ) -> Option<i32> {
        self.tables
            .get(&(version, state, direction))
            .and_then(|table| table.by_kind.get(&kind))
            .copied()
    }

    /// Decodes one packet body (id + payload).
    ///
    /// Ids without a codec are returned as opaque packets in states that
    /// forward them, and are a protocol error everywhere else.
    pub fn decode(
        &self,
        version: ProtocolVersion,
        state: ConnectionState,
        direction: Direction,
        body: Bytes,
    ) -> Result<DecodedPacket, ProtocolError> {
        let mut decoder = Decoder::new(&body, version);
        let (id, header_size) = decoder
            .read_var_int_with_size()
            .map_err(ProtocolError::Header)?;

        let entry = match self.resolve(version, state, direction, id) {
            Ok(entry) => entry,
            Err(_) if state.forwards_unknown_packets() => {
                return Ok(DecodedPacket::Opaque(RawPacket {
                    id,
                    payload: body.slice(header_size..),
                }));
            }
            Err(_) => {
                return Err(ProtocolError::UnknownPacket {
                    id,
                    state,
                    direction,
                    version,
                })
            }
        };

        let packet = (entry.decode)(&mut decoder).map_err(|source| ProtocolError::Decode {
            kind: entry.kind,
            source,
        })?;
        if !decoder.is_finished() {
            return Err(ProtocolError::TrailingBytes {
                kind: entry.kind,
                remaining: decoder.buffer().len(),
            });
        }
        Ok(DecodedPacket::Known(packet))
    }

    /// Encodes a packet body (id + payload).
    pub fn encode(
        &self,
        version: ProtocolVersion,
        state: ConnectionState,
        direction: Direction,
        packet: &Packet,
    ) -> Result<Vec<u8>, ProtocolError> {
        let kind = packet.kind();
        let id = self
            .packet_id(version, state, direction, kind)
            .ok_or(ProtocolError::Unencodable {
                kind,
                state,
                direction,
                version,
            })?;
        let mut body = Vec::new();
        let mut encoder = Encoder::new(&mut body, version);
        encoder.write_var_int(id);
        crate::protocol::Encode::encode(packet, &mut encoder);
        Ok(body)
    }

    /// Encodes an opaque packet body. Opaque packets are only ever
    /// forwarded between connections of the same version and state,
    /// so the id is kept as-is.
    pub fn encode_raw(raw: &RawPacket) -> Vec<u8> {
        let mut body = Vec::with_capacity(raw.payload.len() + 5);
        let mut encoder = Encoder::new(&mut body, ProtocolVersion::LATEST);
        encoder.write_var_int(raw.id);
        encoder.write_slice(&raw.payload);
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{KeepAlive, PluginMessage, StartConfiguration};
    use strum::IntoEnumIterator;

    /// Packet ids as documented per version, for the packets with ids that move.
    const DOCUMENTED: &[(i32, ConnectionState, Direction, PacketKind, i32)] = &[
        (47, Play, Clientbound, PacketKind::KeepAlive, 0x00),
        (47, Play, Clientbound, PacketKind::Disconnect, 0x40),
        (47, Play, Clientbound, PacketKind::JoinGame, 0x01),
        (47, Play, Serverbound, PacketKind::PluginMessage, 0x17),
        (47, Play, Serverbound, PacketKind::ClientSettings, 0x15),
        (340, Play, Clientbound, PacketKind::KeepAlive, 0x1f),
        (340, Play, Clientbound, PacketKind::PluginMessage, 0x18),
        (340, Play, Serverbound, PacketKind::KeepAlive, 0x0b),
        (754, Play, Clientbound, PacketKind::Disconnect, 0x19),
        (754, Play, Clientbound, PacketKind::JoinGame, 0x24),
        (758, Play, Serverbound, PacketKind::PluginMessage, 0x0a),
        (762, Play, Clientbound, PacketKind::JoinGame, 0x28),
        (763, Play, Serverbound, PacketKind::KeepAlive, 0x12),
        (764, Play, Clientbound, PacketKind::StartConfiguration, 0x65),
        (764, Play, Serverbound, PacketKind::KeepAlive, 0x14),
        (765, Login, Serverbound, PacketKind::LoginAcknowledged, 0x03),
        (765, Configuration, Clientbound, PacketKind::FinishConfiguration, 0x02),
        (765, Configuration, Serverbound, PacketKind::KeepAlive, 0x03),
        (765, Play, Clientbound, PacketKind::KeepAlive, 0x24),
        (765, Play, Clientbound, PacketKind::Disconnect, 0x1b),
        (765, Play, Clientbound, PacketKind::PluginMessage, 0x18),
        (765, Play, Clientbound, PacketKind::JoinGame, 0x29),
        (765, Play, Clientbound, PacketKind::StartConfiguration, 0x67),
        (765, Play, Serverbound, PacketKind::KeepAlive, 0x15),
        (765, Play, Serverbound, PacketKind::PluginMessage, 0x10),
        (765, Play, Serverbound, PacketKind::ClientSettings, 0x09),
        (765, Play, Serverbound, PacketKind::AcknowledgeConfiguration, 0x0b),
        (766, Configuration, Clientbound, PacketKind::PluginMessage, 0x01),
        (767, Play, Clientbound, PacketKind::Disconnect, 0x1d),
        (768, Play, Clientbound, PacketKind::StartConfiguration, 0x70),
        (768, Play, Serverbound, PacketKind::AcknowledgeConfiguration, 0x0e),
        (769, Play, Serverbound, PacketKind::KeepAlive, 0x1b),
        (769, Play, Serverbound, PacketKind::PluginMessage, 0x15),
        (769, Play, Clientbound, PacketKind::JoinGame, 0x2c),
    ];

    #[test]
    fn documented_ids_resolve() {
        let registry = PacketRegistry::global();
        for &(version, state, direction, kind, id) in DOCUMENTED {
            let version = ProtocolVersion::new(version);
            let entry = registry.resolve(version, state, direction, id).unwrap();
            assert_eq!(entry.kind, kind, "{version} {state} {direction} {id:#04x}");
            assert_eq!(registry.packet_id(version, state, direction, kind), Some(id));
        }
    }

    #[test]
    fn every_declared_packet_resolves_in_every_supported_version() {
        let registry = PacketRegistry::global();
        for &version in SUPPORTED_VERSIONS {
            for declaration in DECLARATIONS {
                let Some(id) = declaration.id_for(version) else {
                    continue;
                };
                let entry = registry
                    .resolve(version, declaration.state, declaration.direction, id)
                    .unwrap();
                assert_eq!(entry.kind, declaration.kind);
            }
        }
    }

    #[test]
    fn configuration_tables_only_exist_for_modern_versions() {
        let registry = PacketRegistry::global();
        for &version in SUPPORTED_VERSIONS {
            for kind in PacketKind::iter() {
                let id = registry.packet_id(version, Configuration, Clientbound, kind);
                if version < ProtocolVersion::V1_20_2 {
                    assert_eq!(id, None);
                }
            }
            let start = registry.packet_id(version, Play, Clientbound, PacketKind::StartConfiguration);
            assert_eq!(start.is_some(), version >= ProtocolVersion::V1_20_2);
        }
    }

    #[test]
    fn ranges_with_gaps() {
        static GAPPY: &[Declaration] = declare! {
            KeepAlive in Play Clientbound: [
                between(0x10, V::V1_8, V::V1_16_4),
                at(0x20, V::V1_19_4),
            ];
        };
        let registry = PacketRegistry::from_declarations(SUPPORTED_VERSIONS, GAPPY).unwrap();
        let id = |v| registry.packet_id(v, Play, Clientbound, PacketKind::KeepAlive);
        assert_eq!(id(V::V1_8), Some(0x10));
        assert_eq!(id(V::V1_12_2), Some(0x10));
        assert_eq!(id(V::V1_16_4), None);
        assert_eq!(id(V::V1_18_2), None);
        assert_eq!(id(V::V1_19_4), Some(0x20));
        assert_eq!(id(V::V1_21_4), Some(0x20));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        static CLASH: &[Declaration] = declare! {
            KeepAlive in Play Clientbound: [at(0x01, V::V1_8)];
            JoinGame in Play Clientbound: [at(0x01, V::V1_8)];
        };
        assert!(matches!(
            PacketRegistry::from_declarations(&[V::V1_8], CLASH),
            Err(RegistryError::DuplicateId { id: 0x01, .. })
        ));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        assert_eq!(
            PacketRegistry::new(&[ProtocolVersion::new(5)]).err(),
            Some(RegistryError::UnsupportedVersion(ProtocolVersion::new(5)))
        );
    }

    #[test]
    fn unknown_ids_are_opaque_only_where_forwarding_is_allowed() {
        let registry = PacketRegistry::global();
        let body = Bytes::from_static(&[0x7f, 1, 2, 3]);
        let decoded = registry
            .decode(V::V1_20_3, Play, Clientbound, body.clone())
            .unwrap();
        assert_eq!(
            decoded,
            DecodedPacket::Opaque(RawPacket {
                id: 0x7f,
                payload: Bytes::from_static(&[1, 2, 3])
            })
        );
        assert!(matches!(
            registry.decode(V::V1_20_3, Login, Clientbound, body),
            Err(ProtocolError::UnknownPacket { id: 0x7f, .. })
        ));
    }

    #[test]
    fn encode_then_decode_uses_version_ids() {
        let registry = PacketRegistry::global();
        let packet = Packet::KeepAlive(KeepAlive { id: 77 });
        let body = registry.encode(V::V1_21_4, Play, Serverbound, &packet).unwrap();
        assert_eq!(body[0], 0x1b);
        let decoded = registry
            .decode(V::V1_21_4, Play, Serverbound, body.into())
            .unwrap();
        assert_eq!(decoded, DecodedPacket::Known(packet));

        assert!(matches!(
            registry.encode(
                V::V1_20,
                Play,
                Clientbound,
                &StartConfiguration.into()
            ),
            Err(ProtocolError::Unencodable { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let registry = PacketRegistry::global();
        let mut body = registry
            .encode(V::V1_20_3, Play, Clientbound, &Packet::KeepAlive(KeepAlive { id: 1 }))
            .unwrap();
        body.push(0);
        assert!(matches!(
            registry.decode(V::V1_20_3, Play, Clientbound, body.into()),
            Err(ProtocolError::TrailingBytes { remaining: 1, .. })
        ));
    }

    #[test]
    fn raw_packets_keep_their_id() {
        let raw = RawPacket {
            id: 0x42,
            payload: Bytes::from_static(b"abc"),
        };
        assert_eq!(PacketRegistry::encode_raw(&raw), b"\x42abc");
        let plugin = Packet::PluginMessage(PluginMessage::new("a:b", vec![]));
        assert!(PacketRegistry::global()
            .encode(V::V1_8, Play, Clientbound, &plugin)
            .is_ok());
    }
}
