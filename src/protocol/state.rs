//! The per-connection protocol state machine.

use crate::protocol::{Capability, ProtocolError, ProtocolVersion};
use std::sync::atomic::{AtomicU8, Ordering};

/// Which set of packets is currently valid on a connection.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
)]
#[repr(u8)]
pub enum ConnectionState {
    Handshake = 0,
    Status = 1,
    Login = 2,
    Configuration = 3,
    Play = 4,
}

impl ConnectionState {
    /// Validates a transition from `self` to `next` for a connection
    /// speaking `version`, returning `next` if it is legal.
    ///
    /// Versions without the configuration state go straight from Login to Play
    /// and can never leave Play.
    pub fn transition(
        self,
        next: ConnectionState,
        version: ProtocolVersion,
    ) -> Result<ConnectionState, ProtocolError> {
        use ConnectionState::*;
        let configuration = version.supports(Capability::ConfigurationState);
        let legal = match (self, next) {
            (Handshake, Status) | (Handshake, Login) => true,
            (Login, Configuration) | (Configuration, Play) | (Play, Configuration) => {
                configuration
            }
            (Login, Play) => !configuration,
            _ => false,
        };
        if legal {
            Ok(next)
        } else {
            Err(ProtocolError::IllegalTransition {
                from: self,
                to: next,
                version,
            })
        }
    }

    /// Whether packets without a registered codec may be forwarded
    /// as opaque bytes in this state.
    pub fn forwards_unknown_packets(self) -> bool {
        matches!(self, ConnectionState::Configuration | ConnectionState::Play)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshake,
            1 => ConnectionState::Status,
            2 => ConnectionState::Login,
            3 => ConnectionState::Configuration,
            _ => ConnectionState::Play,
        }
    }
}

/// The direction a packet travels in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum Direction {
    /// Sent by the client, received by the server.
    Serverbound,
    /// Sent by the server, received by the client.
    Clientbound,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Serverbound => Direction::Clientbound,
            Direction::Clientbound => Direction::Serverbound,
        }
    }
}

/// A connection state that can be read and updated from several tasks.
///
/// Each half of a connection owns one: the state used to decode inbound
/// packets changes at a different point in the stream than the state used
/// to encode outbound ones.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}
