//! The forwarding loops that relay packets between a client and its backend.
//!
//! Each session has one upstream loop (client to backend) for its whole
//! life, and one downstream loop (backend to client) per backend link.
//! Both loops can be paused between packets, which is how the switch
//! coordinator quiesces a session before changing its backend.

use crate::{
    connection::{ConnectionError, PacketSink, PacketStream},
    control_channel::{self, ControlRequest, ControlResponse},
    hooks::{LoginStatus, PacketAction},
    protocol::{
        packet::PluginMessage, Capability, DecodedPacket, Decoder, Direction, Encoder, Packet,
        ProtocolVersion,
    },
    proxy::ProxyContext,
    session::Session,
    switch,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::{select, sync::oneshot};

const BRAND_CHANNEL: &str = "minecraft:brand";
const LEGACY_BRAND_CHANNEL: &str = "MC|Brand";
const REGISTER_CHANNEL: &str = "minecraft:register";
const LEGACY_REGISTER_CHANNEL: &str = "REGISTER";
const UNREGISTER_CHANNEL: &str = "minecraft:unregister";
const LEGACY_UNREGISTER_CHANNEL: &str = "UNREGISTER";

pub(crate) enum LoopCommand {
    /// Stop between packets and acknowledge once stopped.
    Pause(oneshot::Sender<()>),
    Resume,
    Stop,
}

/// Controls one forwarding loop.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    commands: flume::Sender<LoopCommand>,
}

impl LoopHandle {
    pub(crate) fn new() -> (Self, flume::Receiver<LoopCommand>) {
        let (commands, receiver) = flume::unbounded();
        (Self { commands }, receiver)
    }

    /// Returns once the loop is parked between two packets, so nothing it
    /// read is still being forwarded. A loop that has exited counts as parked.
    pub(crate) async fn pause(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(LoopCommand::Pause(ack_tx)).is_ok() {
            ack_rx.await.ok();
        }
    }

    pub(crate) fn resume(&self) {
        self.commands.send(LoopCommand::Resume).ok();
    }

    pub(crate) fn stop(&self) {
        self.commands.send(LoopCommand::Stop).ok();
    }
}

/// Applies a command received while running. Returns `false` if the loop should exit.
async fn apply_command(
    command: Result<LoopCommand, flume::RecvError>,
    commands: &flume::Receiver<LoopCommand>,
) -> bool {
    match command {
        Ok(LoopCommand::Pause(ack)) => {
            ack.send(()).ok();
            wait_while_paused(commands).await
        }
        Ok(LoopCommand::Resume) => true,
        Ok(LoopCommand::Stop) | Err(_) => false,
    }
}

async fn wait_while_paused(commands: &flume::Receiver<LoopCommand>) -> bool {
    loop {
        match commands.recv_async().await {
            Ok(LoopCommand::Resume) => return true,
            Ok(LoopCommand::Pause(ack)) => {
                ack.send(()).ok();
            }
            Ok(LoopCommand::Stop) | Err(_) => return false,
        }
    }
}

/// Relays client packets to the current backend until the client goes away,
/// then tears the session down.
pub(crate) async fn run_upstream(
    ctx: Arc<ProxyContext>,
    session: Arc<Session>,
    commands: flume::Receiver<LoopCommand>,
) {
    let stream = session.client_stream().clone();
    let result: Result<(), ConnectionError> = loop {
        if let Some(reason) = session.take_pending_kick() {
            session.disconnect(&reason).await;
            break Ok(());
        }
        select! {
            biased;
            _ = session.closed() => break Ok(()),
            command = commands.recv_async() => {
                if !apply_command(command, &commands).await {
                    break Ok(());
                }
            }
            packet = stream.recv() => match packet {
                Ok(Some(packet)) => relay_serverbound(&ctx, &session, packet).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
        }
    };

    if let Err(e) = result {
        tracing::warn!("{}: dropping client after error: {e}", session.name());
        if matches!(e, ConnectionError::Protocol(_) | ConnectionError::Codec(_)) {
            session.disconnect(&format!("Protocol error: {e}")).await;
        }
    }
    end_session(&ctx, &session);
}

async fn relay_serverbound(ctx: &ProxyContext, session: &Session, packet: DecodedPacket) {
    let Some(packet) = filter_serverbound(ctx, session, packet) else {
        return;
    };
    let Some(backend) = session.backend() else {
        tracing::trace!("{}: no backend, dropping {}", session.name(), packet.describe());
        return;
    };
    if let Err(e) = backend.sink().forward(packet).await {
        // Losing the backend is handled by its downstream loop.
        tracing::trace!("{}: could not relay to {}: {e}", session.name(), backend.server());
    }
}

/// Runs a client packet through the packet hook and the proxy's own
/// interception. Returns the packet to send on, if any.
pub(crate) fn filter_serverbound(
    ctx: &ProxyContext,
    session: &Session,
    packet: DecodedPacket,
) -> Option<DecodedPacket> {
    let packet = match ctx.hooks().on_packet(session, Direction::Serverbound, &packet) {
        PacketAction::Forward => packet,
        PacketAction::Drop => return None,
        PacketAction::Replace(replacement) => DecodedPacket::Known(replacement),
    };
    observe_serverbound(ctx, session, &packet).then_some(packet)
}

/// Runs a backend packet through the packet hook.
pub(crate) fn filter_clientbound(
    ctx: &ProxyContext,
    session: &Session,
    packet: DecodedPacket,
) -> Option<DecodedPacket> {
    match ctx.hooks().on_packet(session, Direction::Clientbound, &packet) {
        PacketAction::Forward => Some(packet),
        PacketAction::Drop => None,
        PacketAction::Replace(replacement) => Some(DecodedPacket::Known(replacement)),
    }
}

/// Records client state the proxy replays to new backends. Returns `false`
/// for packets that must not reach a backend.
fn observe_serverbound(
    ctx: &ProxyContext,
    session: &Session,
    packet: &DecodedPacket,
) -> bool {
    match packet {
        DecodedPacket::Known(Packet::ClientSettings(settings)) => {
            ctx.hooks().on_settings_changed(session, settings);
            session.set_settings(settings.clone());
            true
        }
        DecodedPacket::Known(Packet::PluginMessage(message)) => {
            observe_client_plugin_message(ctx, session, message)
        }
        _ => true,
    }
}

fn observe_client_plugin_message(
    ctx: &ProxyContext,
    session: &Session,
    message: &PluginMessage,
) -> bool {
    match message.channel.as_str() {
        channel if control_channel::is_control_channel(channel) => {
            tracing::debug!("{}: dropped control message from client", session.name());
            false
        }
        BRAND_CHANNEL | LEGACY_BRAND_CHANNEL => {
            let mut decoder = Decoder::new(&message.data, session.version());
            match decoder.read_string() {
                Ok(brand) => {
                    tracing::debug!("{} is using brand {brand:?}", session.name());
                    ctx.hooks().on_client_brand(session, brand);
                    session.set_brand(brand.to_owned());
                }
                Err(e) => tracing::debug!("{}: unreadable brand: {e}", session.name()),
            }
            true
        }
        REGISTER_CHANNEL | LEGACY_REGISTER_CHANNEL => {
            let channels = parse_channel_list(&message.data);
            if let Err(e) = session.add_channels(&channels) {
                tracing::info!("{}: kicking client: {e}", session.name());
                session.kick_later(format!("Kicked for registering {e}"));
                return false;
            }
            ctx.hooks().on_channels_registered(session, &channels);
            true
        }
        UNREGISTER_CHANNEL | LEGACY_UNREGISTER_CHANNEL => {
            let channels = parse_channel_list(&message.data);
            session.remove_channels(&channels);
            ctx.hooks().on_channels_unregistered(session, &channels);
            true
        }
        _ => true,
    }
}

fn parse_channel_list(data: &[u8]) -> Vec<String> {
    data.split(|&b| b == 0)
        .filter(|name| !name.is_empty())
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .collect()
}

/// The client brand as a plugin message for `version`.
pub(crate) fn brand_message(version: ProtocolVersion, brand: &str) -> PluginMessage {
    let channel = if version.supports(Capability::NamespacedChannels) {
        BRAND_CHANNEL
    } else {
        LEGACY_BRAND_CHANNEL
    };
    let mut data = Vec::new();
    Encoder::new(&mut data, version).write_string(brand);
    PluginMessage::new(channel, data)
}

/// A channel registration as a plugin message for `version`.
pub(crate) fn register_message(version: ProtocolVersion, channels: &[String]) -> PluginMessage {
    let channel = if version.supports(Capability::NamespacedChannels) {
        REGISTER_CHANNEL
    } else {
        LEGACY_REGISTER_CHANNEL
    };
    PluginMessage::new(channel, channels.join("\0").into_bytes())
}

/// Why a downstream loop ended.
enum Downstream {
    Stopped,
    SessionEnded,
    /// The backend disconnected the player.
    Kicked(String),
    Lost(String),
}

/// Relays one backend's packets to the client until the backend goes away
/// or the loop is stopped by a switch.
///
/// Boxed because the loop can start a switch, and a switch spawns a new loop.
pub(crate) fn run_downstream(
    ctx: Arc<ProxyContext>,
    session: Arc<Session>,
    server: String,
    backend: PacketSink,
    stream: PacketStream,
    commands: flume::Receiver<LoopCommand>,
) -> BoxFuture<'static, ()> {
    Box::pin(downstream_loop(ctx, session, server, backend, stream, commands))
}

async fn downstream_loop(
    ctx: Arc<ProxyContext>,
    session: Arc<Session>,
    server: String,
    backend: PacketSink,
    stream: PacketStream,
    commands: flume::Receiver<LoopCommand>,
) {
    let outcome = loop {
        select! {
            biased;
            _ = session.closed() => break Downstream::SessionEnded,
            command = commands.recv_async() => {
                if !apply_command(command, &commands).await {
                    break Downstream::Stopped;
                }
            }
            packet = stream.recv() => match packet {
                Ok(Some(packet)) => {
                    if let Some(reason) = relay_clientbound(&ctx, &session, &backend, packet).await {
                        break Downstream::Kicked(reason);
                    }
                }
                Ok(None) => break Downstream::Lost("connection closed".to_owned()),
                Err(e) => break Downstream::Lost(e.to_string()),
            },
        }
    };

    let reason = match outcome {
        Downstream::Stopped => return,
        Downstream::SessionEnded => {
            backend.close();
            return;
        }
        Downstream::Kicked(reason) => {
            tracing::info!("{} was kicked from {server}: {reason}", session.name());
            reason
        }
        Downstream::Lost(reason) => {
            tracing::warn!("{} lost connection to {server}: {reason}", session.name());
            format!("Lost connection to {server}")
        }
    };
    backend.close();

    if session.is_switching() {
        // The switch in progress finds the link dead if it has to roll back.
        tracing::debug!("{}: {server} went away during a switch", session.name());
        return;
    }
    let still_current = session
        .backend()
        .is_some_and(|link| link.sink().id() == backend.id());
    if still_current {
        switch::spawn_fallback(&ctx, &session, server, reason);
    }
}

/// Relays one clientbound packet. Returns the reason if the backend
/// disconnected the player.
async fn relay_clientbound(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    backend: &PacketSink,
    packet: DecodedPacket,
) -> Option<String> {
    match &packet {
        DecodedPacket::Known(Packet::Disconnect(disconnect)) => {
            return Some(disconnect.reason.plain_text());
        }
        DecodedPacket::Known(Packet::PluginMessage(message))
            if control_channel::is_control_channel(&message.channel) =>
        {
            handle_control_message(ctx, session, backend, message).await;
            return None;
        }
        _ => {}
    }

    let packet = filter_clientbound(ctx, session, packet)?;
    if let Err(e) = session.client().forward(packet).await {
        tracing::trace!("{}: could not relay to client: {e}", session.name());
    }
    None
}

async fn handle_control_message(
    ctx: &Arc<ProxyContext>,
    session: &Arc<Session>,
    backend: &PacketSink,
    message: &PluginMessage,
) {
    let request: ControlRequest = match control_channel::decode(&message.data) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("{}: {e}", session.name());
            return;
        }
    };
    tracing::debug!("{}: control request {request:?}", session.name());

    let response = match request {
        ControlRequest::GetServers => {
            ControlResponse::Servers(ctx.config().servers.keys().cloned().collect())
        }
        ControlRequest::GetCurrentServer => ControlResponse::CurrentServer(session.current_server()),
        ControlRequest::Connect { server } => {
            // Switching pauses this loop, so it has to run elsewhere.
            let ctx = Arc::clone(ctx);
            let session = Arc::clone(session);
            let backend = backend.clone();
            tokio::spawn(async move {
                if let Err(e) = switch::initiate_switch(&ctx, &session, &server).await {
                    let response = ControlResponse::ConnectFailed {
                        server,
                        reason: e.to_string(),
                    };
                    send_control_response(&backend, &response).await;
                }
            });
            return;
        }
    };
    send_control_response(backend, &response).await;
}

async fn send_control_response(backend: &PacketSink, response: &ControlResponse) {
    match control_channel::to_plugin_message(response) {
        Ok(message) => {
            if let Err(e) = backend.send(message).await {
                tracing::debug!("failed to answer control request: {e}");
            }
        }
        Err(e) => tracing::warn!("failed to encode control response: {e}"),
    }
}

/// Releases everything a session holds and tells the hooks it is gone.
pub(crate) fn end_session(ctx: &ProxyContext, session: &Arc<Session>) {
    if !session.mark_ended() {
        return;
    }
    session.cancel();
    session.client().close();
    if let Some(backend) = session.swap_backend(None) {
        backend.close();
    }
    ctx.sessions().unregister(session);

    let status = if session.was_kicked() {
        LoginStatus::CancelledByProxy
    } else if session.has_joined() {
        LoginStatus::SuccessfulLogin
    } else {
        LoginStatus::PreServerJoin
    };
    tracing::info!("{} disconnected ({status:?})", session.name());
    ctx.hooks().on_disconnect(session, status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_lists() {
        assert_eq!(
            parse_channel_list(b"a:b\0c:d\0\0"),
            vec!["a:b".to_owned(), "c:d".to_owned()]
        );
        assert!(parse_channel_list(b"").is_empty());
    }

    #[test]
    fn brand_channel_follows_the_version() {
        let modern = brand_message(ProtocolVersion::V1_20_3, "vanilla");
        assert_eq!(modern.channel, BRAND_CHANNEL);
        assert_eq!(modern.data, b"\x07vanilla");
        assert_eq!(
            brand_message(ProtocolVersion::V1_12_2, "vanilla").channel,
            LEGACY_BRAND_CHANNEL
        );
        let register = register_message(ProtocolVersion::V1_8, &["A".into(), "B".into()]);
        assert_eq!(register.channel, LEGACY_REGISTER_CHANNEL);
        assert_eq!(register.data, b"A\0B");
    }

    #[tokio::test]
    async fn paused_loops_wait_for_resume() {
        let (handle, commands) = LoopHandle::new();
        let worker = tokio::spawn(async move {
            let mut resumed = 0;
            while let Ok(command) = commands.recv_async().await {
                if !apply_command(Ok(command), &commands).await {
                    break;
                }
                resumed += 1;
            }
            resumed
        });

        handle.pause().await;
        handle.resume();
        handle.pause().await;
        handle.resume();
        handle.stop();
        assert_eq!(worker.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pausing_an_exited_loop_returns() {
        let (handle, commands) = LoopHandle::new();
        drop(commands);
        handle.pause().await;
    }
}
