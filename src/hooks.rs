//! Points where embedding code can observe and steer the proxy.
//!
//! Hooks are called inline on the connection tasks, so they must return
//! quickly and never block.

use crate::{
    auth::GameProfile,
    protocol::{
        packet::{ClientSettings, Handshake},
        DecodedPacket, Direction, Packet, ProtocolVersion,
    },
    session::Session,
    switch::SwitchError,
};
use std::net::SocketAddr;

/// What to do with a packet passing through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketAction {
    Forward,
    Drop,
    Replace(Packet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDecision {
    Allowed,
    Denied(String),
}

/// Answer to a request to move a player to another backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchDecision {
    Allowed,
    Denied(String),
    /// Switch to this server instead.
    Redirect(String),
}

/// How far a player got before their connection ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoginStatus {
    /// Joined a backend at least once.
    SuccessfulLogin,
    /// Dropped because the same profile logged in elsewhere.
    ConflictingLogin,
    /// Disconnected by the proxy, for example when no backend would take them.
    CancelledByProxy,
    /// Left before joining any backend.
    PreServerJoin,
}

#[allow(unused_variables)]
pub trait ProxyHooks: Send + Sync + 'static {
    fn on_handshake(&self, handshake: &Handshake, remote_address: Option<SocketAddr>) {}

    /// Called after authentication, before the player is told login succeeded.
    fn on_login(&self, profile: &GameProfile, version: ProtocolVersion) -> LoginDecision {
        LoginDecision::Allowed
    }

    /// Called for every packet relayed between a client and its backend.
    fn on_packet(
        &self,
        session: &Session,
        direction: Direction,
        packet: &DecodedPacket,
    ) -> PacketAction {
        PacketAction::Forward
    }

    fn on_switch_requested(&self, session: &Session, target: &str) -> SwitchDecision {
        SwitchDecision::Allowed
    }

    fn on_switch_completed(&self, session: &Session, previous: Option<&str>, server: &str) {}

    fn on_switch_failed(&self, session: &Session, target: &str, error: &SwitchError) {}

    fn on_client_brand(&self, session: &Session, brand: &str) {}

    fn on_settings_changed(&self, session: &Session, settings: &ClientSettings) {}

    fn on_channels_registered(&self, session: &Session, channels: &[String]) {}

    fn on_channels_unregistered(&self, session: &Session, channels: &[String]) {}

    fn on_disconnect(&self, session: &Session, status: LoginStatus) {}
}

/// Hooks that let everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ProxyHooks for NoHooks {}
