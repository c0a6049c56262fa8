//! The control channel is a plugin-message channel reserved for
//! signalling between backends and the proxy.
//!
//! Messages are `bincode`-encoded. Backends send [`ControlRequest`]s; the
//! proxy answers on the same channel with [`ControlResponse`]s. The channel
//! is never relayed to clients, and anything a client sends on it is dropped.

use crate::protocol::packet::PluginMessage;
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const CONTROL_CHANNEL: &str = "relay:control";

/// Upper bound on a decoded message, so a backend cannot make the
/// proxy allocate without limit.
const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("malformed control message: {0}")]
pub struct ControlError(#[from] bincode::Error);

/// A message sent by a backend to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Move the player this backend is serving to another server.
    Connect { server: String },
    /// List the configured servers.
    GetServers,
    /// Name of the server the player is connected to.
    GetCurrentServer,
}

/// A message sent by the proxy to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    Servers(Vec<String>),
    CurrentServer(Option<String>),
    /// Sent to the requesting backend when a `Connect` could not be carried out.
    ConnectFailed { server: String, reason: String },
}

pub fn is_control_channel(channel: &str) -> bool {
    channel == CONTROL_CHANNEL
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ControlError> {
    Ok(options().serialize(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ControlError> {
    Ok(options().deserialize(bytes)?)
}

/// Wraps a message in a plugin message on the control channel.
pub fn to_plugin_message<T: Serialize>(message: &T) -> Result<PluginMessage, ControlError> {
    Ok(PluginMessage::new(CONTROL_CHANNEL, encode(message)?))
}

fn options() -> impl Options {
    bincode::options().with_limit(MAX_MESSAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_survive_the_plugin_message() {
        let request = ControlRequest::Connect {
            server: "lobby".into(),
        };
        let message = to_plugin_message(&request).unwrap();
        assert!(is_control_channel(&message.channel));
        assert_eq!(decode::<ControlRequest>(&message.data).unwrap(), request);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode::<ControlRequest>(&[0xff, 0xff, 0xff]).is_err());
        assert!(decode::<ControlResponse>(&[]).is_err());
    }
}
