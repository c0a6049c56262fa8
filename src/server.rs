//! Accepts client connections and takes each one through handshake,
//! login and into a session.

use crate::{
    connection::{Connection, Side},
    hooks::LoginStatus,
    login::{self, LoginError},
    pipeline,
    protocol::{
        packet::HandshakeIntent, Capability, ConnectionState, Packet, ProtocolError,
        ProtocolVersion,
    },
    proxy::ProxyContext,
    session::Session,
    status, switch,
    transport::BoxedTransport,
};
use anyhow::{bail, Context};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, time::timeout};

/// Runs the accept loop until the listener fails.
pub async fn run(ctx: Arc<ProxyContext>, listener: TcpListener) -> anyhow::Result<()> {
    tracing::info!("Listening on {}", listener.local_addr()?);
    loop {
        let (stream, remote_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Failed to accept a connection: {e}");
                continue;
            }
        };
        stream.set_nodelay(true).ok();
        tracing::debug!("Accepted connection from {remote_address}");

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, Box::new(stream), Some(remote_address)).await {
                tracing::info!("Connection from {remote_address} lost: {e:#}");
            }
        });
    }
}

/// Serves one client connection from its first byte. Returns once the
/// connection is handed to a session, or once it has been turned away.
pub async fn handle_connection(
    ctx: Arc<ProxyContext>,
    transport: BoxedTransport,
    remote_address: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let versions = &ctx.settings().supported_versions;
    let (Some(&oldest), Some(&newest)) = (versions.first(), versions.last()) else {
        bail!("no protocol versions are enabled");
    };

    let mut connection = Connection::new(
        transport,
        Side::Server,
        Arc::clone(ctx.registry()),
        ctx.options().clone(),
    );
    if let Some(address) = remote_address {
        connection = connection.with_peer_address(address);
    }
    // The handshake looks the same in every version.
    connection.set_version(newest);
    let handshake = match timeout(ctx.config().login_timeout(), connection.read_known("Handshake"))
        .await
        .context("timed out waiting for the handshake")??
    {
        Packet::Handshake(handshake) => handshake,
        other => bail!("expected a handshake, got {}", other.kind().as_ref()),
    };
    ctx.hooks().on_handshake(&handshake, remote_address);

    let requested = ProtocolVersion::new(handshake.protocol_version);
    let supported = ctx.registry().supports(requested);
    if supported {
        connection.set_version(requested);
    }

    if handshake.intent == HandshakeIntent::Status {
        status::respond(&ctx, connection, handshake.protocol_version).await?;
        return Ok(());
    }

    if !supported {
        // Talk to the client in the nearest version we have so it can read the reason.
        connection.set_version(if requested < oldest { oldest } else { newest });
        connection.set_state(ConnectionState::Login)?;
        tracing::info!("Rejecting client using unsupported {requested}");
        connection
            .disconnect(&format!(
                "Unsupported client version. Please use {} to {}.",
                oldest.release_name().unwrap_or_default(),
                newest.release_name().unwrap_or_default()
            ))
            .await;
        return Ok(());
    }
    if handshake.intent == HandshakeIntent::Transfer
        && !requested.supports(Capability::TransferIntent)
    {
        return Err(ProtocolError::UnsupportedIntent {
            intent: handshake.intent.id(),
            version: requested,
        }
        .into());
    }

    connection.set_state(ConnectionState::Login)?;
    let profile = match login::login(&ctx, &mut connection).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::info!("Login from {remote_address:?} failed: {e}");
            connection.disconnect(&e.disconnect_message()).await;
            return Ok(());
        }
    };

    let virtual_host = handshake.virtual_host().to_owned();
    let (client, client_stream) = connection.into_link();
    let (session, commands) =
        Session::new(profile, remote_address, virtual_host, client, client_stream);
    if let Err(e) = ctx.sessions().register(Arc::clone(&session)) {
        // Lost a race with a concurrent login of the same player.
        session
            .disconnect(&LoginError::AlreadyConnected(e.0).disconnect_message())
            .await;
        ctx.hooks().on_disconnect(&session, LoginStatus::ConflictingLogin);
        return Ok(());
    }

    tokio::spawn(pipeline::run_upstream(
        Arc::clone(&ctx),
        Arc::clone(&session),
        commands,
    ));
    switch::connect_initial(&ctx, &session).await;
    Ok(())
}
