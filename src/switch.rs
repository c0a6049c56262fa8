//! Moving a live session from one backend to another.
//!
//! A switch logs a new backend in, brings the client over to it and only
//! then swaps it in as the session's backend. Until the swap the previous
//! backend stays in place, so any failure leaves the player where they were.

use crate::{
    config::ForwardingMode,
    connection::{Connection, ConnectionError, PacketSink, PacketStream, Side},
    control_channel,
    hooks::SwitchDecision,
    pipeline::{self, LoopHandle},
    protocol::{
        packet::{
            Component, FinishConfiguration, Handshake, HandshakeIntent, LoginAcknowledged,
            LoginPluginResponse, LoginStart, StartConfiguration,
        },
        Capability, CompressionThreshold, ConnectionState, DecodedPacket, Packet, ProtocolError,
    },
    proxy::ProxyContext,
    session::{BackendLink, Session},
};
use std::sync::Arc;
use tokio::{select, time::timeout};

const DEFAULT_PORT: u16 = 25565;

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("a server switch is already in progress")]
    AlreadySwitching,
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("unknown server {0:?}")]
    UnknownServer(String),
    #[error("switch denied: {0}")]
    Denied(String),
    #[error("could not connect to {server}: {reason}")]
    BackendUnreachable { server: String, reason: String },
    #[error("{server} refused the login: {reason}")]
    BackendLoginRejected { server: String, reason: String },
    #[error("configuration with {server} failed: {reason}")]
    ConfigurationExchangeFailed { server: String, reason: String },
    #[error("the player left during the switch")]
    Cancelled,
}

/// Moves `session` to the configured server `target`, asking the hooks first.
///
/// Failures are reported to [`ProxyHooks::on_switch_failed`](crate::hooks::ProxyHooks::on_switch_failed)
/// and leave the previous backend in place. If there is no usable previous
/// backend the session falls back to the `try` list.
pub async fn initiate_switch(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    target: &str,
) -> Result<(), SwitchError> {
    let target = match ctx.hooks().on_switch_requested(session, target) {
        SwitchDecision::Allowed => target.to_owned(),
        SwitchDecision::Redirect(other) => {
            tracing::debug!("{}: switch to {target} redirected to {other}", session.name());
            other
        }
        SwitchDecision::Denied(reason) => {
            let error = SwitchError::Denied(reason);
            ctx.hooks().on_switch_failed(session, target, &error);
            return Err(error);
        }
    };

    let result = perform_switch(ctx, session, &target).await;
    if let Err(e) = &result {
        tracing::warn!("{} could not switch to {target}: {e}", session.name());
        ctx.hooks().on_switch_failed(session, &target, e);
        let others_handle_it = matches!(e, SwitchError::AlreadySwitching | SwitchError::Cancelled);
        if !others_handle_it && session.backend_is_dead() && !session.is_closed() {
            spawn_fallback(ctx, session, target, e.to_string());
        }
    }
    result
}

/// Where the client is in the reconfiguration dance. Used to walk it back
/// to the previous backend if the switch fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ClientPhase {
    Play,
    /// Sent StartConfiguration, waiting for the client to acknowledge it.
    AwaitingAck,
    Configuring,
    /// Forwarded the new backend's FinishConfiguration.
    Finishing,
}

struct Progress {
    phase: ClientPhase,
    /// Set before pausing so a cancelled pause is still undone.
    paused: bool,
    started_in_configuration: bool,
    previous: Option<Arc<BackendLink>>,
}

/// Runs the switch without consulting the hooks.
pub(crate) async fn perform_switch(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    target: &str,
) -> Result<(), SwitchError> {
    let address = ctx
        .config()
        .server_address(target)
        .ok_or_else(|| SwitchError::UnknownServer(target.to_owned()))?
        .to_owned();
    if let Some(current) = session.backend() {
        if current.server() == target && current.is_alive() {
            return Err(SwitchError::AlreadyConnected(target.to_owned()));
        }
    }
    let _guard = session.begin_switch(target)?;
    tracing::info!("{} is connecting to {target} ({address})", session.name());

    let (backend, stream) = select! {
        biased;
        _ = session.closed() => return Err(SwitchError::Cancelled),
        result = timeout(ctx.config().login_timeout(), connect_backend(ctx, session, target, &address)) => {
            result.map_err(|_| unreachable(target, "login timed out"))??
        }
    };

    let client_state = session.client().state();
    let mut progress = Progress {
        phase: match client_state {
            ConnectionState::Configuration => ClientPhase::Configuring,
            _ => ClientPhase::Play,
        },
        paused: false,
        started_in_configuration: client_state == ConnectionState::Configuration,
        previous: session.backend(),
    };

    let result = select! {
        biased;
        _ = session.closed() => Err(SwitchError::Cancelled),
        result = timeout(
            ctx.config().switch_timeout(),
            rehome_and_commit(ctx, session, target, &backend, &stream, &mut progress),
        ) => result.unwrap_or_else(|_| Err(SwitchError::ConfigurationExchangeFailed {
            server: target.to_owned(),
            reason: "timed out".to_owned(),
        })),
    };

    if let Err(e) = &result {
        backend.close();
        roll_back(ctx, session, &progress, e).await;
    }
    result
}

fn unreachable(server: &str, reason: impl ToString) -> SwitchError {
    SwitchError::BackendUnreachable {
        server: server.to_owned(),
        reason: reason.to_string(),
    }
}

/// Opens a connection to a backend and logs in as the session's player.
async fn connect_backend(
    ctx: &ProxyContext,
    session: &Session,
    server: &str,
    address: &str,
) -> Result<(PacketSink, PacketStream), SwitchError> {
    let transport = timeout(ctx.config().connect_timeout(), ctx.connector().connect(address))
        .await
        .map_err(|_| unreachable(server, "connection timed out"))?
        .map_err(|e| unreachable(server, e))?;

    let version = session.version();
    let mut connection = Connection::new(
        transport,
        Side::Client,
        Arc::clone(ctx.registry()),
        ctx.options().clone(),
    );
    connection.set_version(version);

    let (host, port) = split_address(address);
    let handshake = Handshake {
        protocol_version: version.id(),
        server_address: handshake_address(ctx, session, host),
        server_port: port,
        intent: HandshakeIntent::Login,
    };
    let login = async {
        connection.write_packet(handshake).await?;
        connection.set_state(ConnectionState::Login)?;
        connection
            .write_packet(LoginStart {
                username: session.name().to_owned(),
                uuid: Some(session.id()),
            })
            .await?;
        Ok::<_, ConnectionError>(())
    };
    login.await.map_err(|e| unreachable(server, e))?;

    let rejected = |reason: String| SwitchError::BackendLoginRejected {
        server: server.to_owned(),
        reason,
    };
    loop {
        let packet = connection
            .read_known("a login response")
            .await
            .map_err(|e| unreachable(server, e))?;
        match packet {
            Packet::SetCompression(compression) => {
                if let Some(threshold) = CompressionThreshold::new(compression.threshold) {
                    connection
                        .enable_compression(threshold)
                        .map_err(|e| unreachable(server, e))?;
                }
            }
            Packet::LoginPluginRequest(request) => {
                tracing::debug!(
                    "{server} sent login plugin request on {}, answering not understood",
                    request.channel
                );
                connection
                    .write_packet(LoginPluginResponse {
                        message_id: request.message_id,
                        successful: false,
                        data: Vec::new(),
                    })
                    .await
                    .map_err(|e| unreachable(server, e))?;
            }
            Packet::EncryptionRequest(_) => {
                return Err(rejected("the server is in online mode".to_owned()));
            }
            Packet::LoginDisconnect(disconnect) => {
                return Err(rejected(Component::Json(disconnect.reason).plain_text()));
            }
            Packet::LoginSuccess(success) => {
                tracing::debug!(
                    "{server} accepted {} as {}",
                    success.username,
                    success.uuid
                );
                break;
            }
            other => {
                let error = ProtocolError::UnexpectedPacket {
                    expected: "a login response",
                    got: other.kind().as_ref().to_owned(),
                };
                return Err(unreachable(server, error));
            }
        }
    }

    let finish = async {
        if version.supports(Capability::ConfigurationState) {
            connection.write_packet(LoginAcknowledged).await?;
            connection.set_state(ConnectionState::Configuration)?;
        } else {
            connection.set_state(ConnectionState::Play)?;
        }
        Ok::<_, ConnectionError>(())
    };
    finish.await.map_err(|e| unreachable(server, e))?;
    Ok(connection.into_link())
}

fn split_address(address: &str) -> (&str, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, port),
            Err(_) => (address, DEFAULT_PORT),
        },
        None => (address, DEFAULT_PORT),
    }
}

/// The handshake address, carrying the player's identity when legacy
/// forwarding is on.
fn handshake_address(ctx: &ProxyContext, session: &Session, host: &str) -> String {
    match ctx.config().forwarding {
        ForwardingMode::None => host.to_owned(),
        ForwardingMode::Legacy => {
            let ip = session
                .remote_address()
                .map(|address| address.ip().to_string())
                .unwrap_or_else(|| "127.0.0.1".to_owned());
            let properties = serde_json::to_string(&session.profile().properties)
                .unwrap_or_else(|_| "[]".to_owned());
            format!("{host}\0{ip}\0{}\0{properties}", session.id().simple())
        }
    }
}

async fn rehome_and_commit(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    target: &str,
    backend: &PacketSink,
    stream: &PacketStream,
    progress: &mut Progress,
) -> Result<(), SwitchError> {
    let pending = if session.version().supports(Capability::ConfigurationState) {
        reconfigure(ctx, session, target, backend, stream, progress).await?;
        Vec::new()
    } else {
        await_join(target, stream).await?
    };
    commit(ctx, session, target, backend, stream, pending, progress).await
}

async fn pause(session: &Session, progress: &mut Progress) {
    if progress.paused {
        return;
    }
    progress.paused = true;
    session.upstream().pause().await;
    if let Some(previous) = &progress.previous {
        previous.downstream().pause().await;
    }
}

fn resume(session: &Session, progress: &Progress) {
    if !progress.paused {
        return;
    }
    if let Some(previous) = &progress.previous {
        previous.downstream().resume();
    }
    session.upstream().resume();
}

/// Takes the client through a configuration phase with the new backend.
async fn reconfigure(
    ctx: &ProxyContext,
    session: &Session,
    target: &str,
    backend: &PacketSink,
    stream: &PacketStream,
    progress: &mut Progress,
) -> Result<(), SwitchError> {
    pause(session, progress).await;
    let client = session.client();
    let client_stream = session.client_stream();

    if progress.phase == ClientPhase::Play {
        client
            .send(StartConfiguration)
            .await
            .map_err(|_| SwitchError::Cancelled)?;
        progress.phase = ClientPhase::AwaitingAck;
        await_acknowledgement(ctx, session, progress.previous.as_deref()).await?;
        progress.phase = ClientPhase::Configuring;
    }

    let failed = |reason: String| SwitchError::ConfigurationExchangeFailed {
        server: target.to_owned(),
        reason,
    };
    replay_client_state(session, backend)
        .await
        .map_err(|e| failed(e.to_string()))?;

    loop {
        select! {
            packet = stream.recv() => match packet {
                Ok(Some(DecodedPacket::Known(Packet::Disconnect(disconnect)))) => {
                    return Err(failed(disconnect.reason.plain_text()));
                }
                Ok(Some(DecodedPacket::Known(Packet::FinishConfiguration(_)))) => {
                    client
                        .send(FinishConfiguration)
                        .await
                        .map_err(|_| SwitchError::Cancelled)?;
                    progress.phase = ClientPhase::Finishing;
                }
                Ok(Some(DecodedPacket::Known(Packet::PluginMessage(message))))
                    if control_channel::is_control_channel(&message.channel) =>
                {
                    tracing::debug!("{target}: ignoring control message during configuration");
                }
                Ok(Some(packet)) => {
                    if let Some(packet) = pipeline::filter_clientbound(ctx, session, packet) {
                        client.forward(packet).await.map_err(|_| SwitchError::Cancelled)?;
                    }
                }
                Ok(None) => return Err(failed("connection closed".to_owned())),
                Err(e) => return Err(failed(e.to_string())),
            },
            packet = client_stream.recv() => match packet {
                Ok(Some(DecodedPacket::Known(Packet::FinishConfiguration(_))))
                    if progress.phase == ClientPhase::Finishing =>
                {
                    backend
                        .send(FinishConfiguration)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    progress.phase = ClientPhase::Play;
                    return Ok(());
                }
                Ok(Some(packet)) => {
                    if let Some(packet) = pipeline::filter_serverbound(ctx, session, packet) {
                        backend.forward(packet).await.map_err(|e| failed(e.to_string()))?;
                    }
                }
                Ok(None) => return Err(SwitchError::Cancelled),
                Err(e) => return Err(drop_client(session, e).await),
            },
        }
    }
}

/// Reads client packets until it acknowledges StartConfiguration. Earlier
/// packets still belong to the previous backend.
async fn await_acknowledgement(
    ctx: &ProxyContext,
    session: &Session,
    previous: Option<&BackendLink>,
) -> Result<(), SwitchError> {
    loop {
        match session.client_stream().recv().await {
            Ok(Some(DecodedPacket::Known(Packet::AcknowledgeConfiguration(_)))) => return Ok(()),
            Ok(Some(packet)) => {
                let Some(packet) = pipeline::filter_serverbound(ctx, session, packet) else {
                    continue;
                };
                if let Some(previous) = previous {
                    previous.sink().forward(packet).await.ok();
                }
            }
            Ok(None) => return Err(SwitchError::Cancelled),
            Err(e) => return Err(drop_client(session, e).await),
        }
    }
}

/// Waits for the client to finish a configuration phase, dropping what it
/// sends meanwhile.
async fn await_client_finish(ctx: &ProxyContext, session: &Session) -> Result<(), SwitchError> {
    loop {
        match session.client_stream().recv().await {
            Ok(Some(DecodedPacket::Known(Packet::FinishConfiguration(_)))) => return Ok(()),
            Ok(Some(packet)) => {
                pipeline::filter_serverbound(ctx, session, packet);
            }
            Ok(None) => return Err(SwitchError::Cancelled),
            Err(e) => return Err(drop_client(session, e).await),
        }
    }
}

async fn drop_client(session: &Session, error: ConnectionError) -> SwitchError {
    tracing::warn!("{}: dropping client during switch: {error}", session.name());
    session.disconnect(&format!("Protocol error: {error}")).await;
    SwitchError::Cancelled
}

/// Reads the legacy backend's packets up to and including its JoinGame.
async fn await_join(target: &str, stream: &PacketStream) -> Result<Vec<DecodedPacket>, SwitchError> {
    let mut pending = Vec::new();
    loop {
        match stream.recv().await {
            Ok(Some(DecodedPacket::Known(Packet::Disconnect(disconnect)))) => {
                return Err(SwitchError::BackendLoginRejected {
                    server: target.to_owned(),
                    reason: disconnect.reason.plain_text(),
                });
            }
            Ok(Some(packet @ DecodedPacket::Known(Packet::JoinGame(_)))) => {
                pending.push(packet);
                return Ok(pending);
            }
            Ok(Some(DecodedPacket::Known(Packet::PluginMessage(message))))
                if control_channel::is_control_channel(&message.channel) => {}
            Ok(Some(packet)) => pending.push(packet),
            Ok(None) => return Err(unreachable(target, "connection closed before joining")),
            Err(e) => return Err(unreachable(target, e)),
        }
    }
}

/// Sends the new backend what the client told earlier backends about itself.
async fn replay_client_state(session: &Session, backend: &PacketSink) -> Result<(), ConnectionError> {
    let version = session.version();
    if let Some(settings) = session.settings() {
        backend.send(Packet::ClientSettings((*settings).clone())).await?;
    }
    if let Some(brand) = session.brand() {
        backend.send(pipeline::brand_message(version, &brand)).await?;
    }
    let channels = session.channels();
    if !channels.is_empty() {
        backend
            .send(pipeline::register_message(version, &channels))
            .await?;
    }
    Ok(())
}

/// Swaps the new backend in. Nothing after the swap can suspend, so once
/// the swap happens the switch has completed.
async fn commit(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    target: &str,
    backend: &PacketSink,
    stream: &PacketStream,
    pending: Vec<DecodedPacket>,
    progress: &mut Progress,
) -> Result<(), SwitchError> {
    pause(session, progress).await;
    if backend.is_closed() {
        return Err(unreachable(target, "connection closed"));
    }
    if !session.version().supports(Capability::ConfigurationState) {
        replay_client_state(session, backend)
            .await
            .map_err(|e| unreachable(target, e))?;
    }
    for packet in pending {
        session
            .client()
            .forward(packet)
            .await
            .map_err(|_| SwitchError::Cancelled)?;
    }

    let (downstream, commands) = LoopHandle::new();
    let link = Arc::new(BackendLink::new(
        target.to_owned(),
        backend.clone(),
        downstream,
    ));
    let previous = session.swap_backend(Some(link));
    tokio::spawn(pipeline::run_downstream(
        Arc::clone(ctx),
        Arc::clone(session),
        target.to_owned(),
        backend.clone(),
        stream.clone(),
        commands,
    ));
    if let Some(previous) = &previous {
        previous.close();
    }
    session.upstream().resume();
    progress.paused = false;
    session.mark_joined();

    let previous = previous.as_ref().map(|link| link.server());
    match previous {
        Some(previous) => tracing::info!("{} switched from {previous} to {target}", session.name()),
        None => tracing::info!("{} joined {target}", session.name()),
    }
    ctx.hooks().on_switch_completed(session, previous, target);
    Ok(())
}

/// Returns the client to the previous backend after a failed switch and
/// restarts the paused loops. Drops the player if the client cannot be
/// brought back.
async fn roll_back(ctx: &ProxyContext, session: &Session, progress: &Progress, error: &SwitchError) {
    if !matches!(error, SwitchError::Cancelled) && !session.is_closed() {
        let restored = timeout(ctx.config().switch_timeout(), restore_client(ctx, session, progress))
            .await
            .unwrap_or(Err(SwitchError::Cancelled));
        if restored.is_err() {
            session
                .disconnect(&format!("Failed to return to your previous server: {error}"))
                .await;
        }
    }
    resume(session, progress);
}

/// Walks the client back to Play. A client that entered configuration
/// gets FinishConfiguration without fresh registry or join data from the
/// previous backend, so until that backend sends something a vanilla
/// client stays on its loading screen. The connection itself stays open.
async fn restore_client(
    ctx: &ProxyContext,
    session: &Session,
    progress: &Progress,
) -> Result<(), SwitchError> {
    let client = session.client();
    let mut phase = progress.phase;
    if phase == ClientPhase::AwaitingAck {
        await_acknowledgement(ctx, session, progress.previous.as_deref()).await?;
        phase = ClientPhase::Configuring;
    }
    if phase == ClientPhase::Configuring {
        if progress.started_in_configuration {
            // The client never left configuration; the next backend takes it from here.
            return Ok(());
        }
        client
            .send(FinishConfiguration)
            .await
            .map_err(|_| SwitchError::Cancelled)?;
        phase = ClientPhase::Finishing;
    }
    if phase == ClientPhase::Finishing {
        await_client_finish(ctx, session).await?;
    }
    Ok(())
}

/// Moves a session whose backend went away to the next `try` server, or
/// disconnects it with `reason` if none will take it.
pub(crate) fn spawn_fallback(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    failed: String,
    reason: String,
) {
    let ctx = Arc::clone(ctx);
    let session = Arc::clone(session);
    tokio::spawn(async move {
        for server in ctx.config().try_servers.iter().filter(|s| **s != failed) {
            if session.is_closed() {
                return;
            }
            match perform_switch(&ctx, &session, server).await {
                Ok(()) => return,
                Err(SwitchError::AlreadySwitching) | Err(SwitchError::Cancelled) => return,
                Err(e) => {
                    tracing::warn!("{} could not fall back to {server}: {e}", session.name());
                    ctx.hooks().on_switch_failed(&session, server, &e);
                }
            }
        }
        if !session.is_closed() {
            session.disconnect(&reason).await;
        }
    });
}

/// Connects a freshly logged-in session to the first `try` server that
/// accepts it.
pub(crate) async fn connect_initial(ctx: &Arc<ProxyContext>, session: &Arc<Session>) {
    let mut last_error = None;
    for server in &ctx.config().try_servers {
        match perform_switch(ctx, session, server).await {
            Ok(()) => return,
            Err(SwitchError::Cancelled) => return,
            Err(e) => {
                tracing::warn!("{} could not connect to {server}: {e}", session.name());
                ctx.hooks().on_switch_failed(session, server, &e);
                last_error = Some(e);
            }
        }
    }
    let reason = match last_error {
        Some(e) => format!("Unable to connect to any server: {e}"),
        None => "No servers are available".to_owned(),
    };
    session.disconnect(&reason).await;
}
