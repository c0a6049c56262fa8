//! Answers server-list pings locally.

use crate::{
    connection::{Connection, ConnectionError},
    protocol::{
        packet::StatusResponse, ConnectionState, Packet, ProtocolError, ProtocolVersion,
    },
    proxy::ProxyContext,
};
use serde_json::json;

/// Serves one status exchange. `client_protocol` is the protocol number
/// from the client's handshake, which may not be one the proxy supports.
pub(crate) async fn respond(
    ctx: &ProxyContext,
    mut connection: Connection,
    client_protocol: i32,
) -> Result<(), ConnectionError> {
    connection.set_state(ConnectionState::Status)?;
    loop {
        let packet = match connection.read_known("a status packet").await {
            Ok(packet) => packet,
            Err(ConnectionError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        match packet {
            Packet::StatusRequest(_) => {
                let json = status_json(ctx, client_protocol);
                connection.write_packet(StatusResponse { json }).await?;
            }
            Packet::StatusPing(ping) => {
                connection.write_packet(ping).await?;
                return Ok(());
            }
            other => {
                return Err(ProtocolError::UnexpectedPacket {
                    expected: "a status packet",
                    got: other.kind().as_ref().to_owned(),
                }
                .into())
            }
        }
    }
}

fn status_json(ctx: &ProxyContext, client_protocol: i32) -> String {
    let versions = &ctx.settings().supported_versions;
    let protocol = match versions.iter().find(|v| v.id() == client_protocol) {
        Some(version) => version.id(),
        None => versions.last().map_or(ProtocolVersion::LATEST.id(), |v| v.id()),
    };
    json!({
        "version": {
            "name": version_range(versions),
            "protocol": protocol,
        },
        "players": {
            "max": ctx.config().max_players,
            "online": ctx.sessions().len(),
            "sample": [],
        },
        "description": { "text": ctx.config().motd },
    })
    .to_string()
}

fn version_range(versions: &[ProtocolVersion]) -> String {
    let name = |version: &ProtocolVersion| {
        version
            .release_name()
            .map_or_else(|| version.id().to_string(), str::to_owned)
    };
    match (versions.first(), versions.last()) {
        (Some(oldest), Some(newest)) if oldest != newest => {
            format!("{}-{}", name(oldest), name(newest))
        }
        (Some(only), _) => name(only),
        _ => String::new(),
    }
}
