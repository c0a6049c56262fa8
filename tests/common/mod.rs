//! In-memory harness: a proxy whose backends and clients are connected
//! through `tokio::io::duplex` pipes.

#![allow(dead_code)]

use futures::future::BoxFuture;
use minecraft_relay::{
    auth::{AuthError, Authenticator, GameProfile},
    connection::{Connection, ConnectionOptions, Side},
    hooks::{LoginStatus, PacketAction, ProxyHooks, SwitchDecision},
    protocol::{
        packet::{
            FinishConfiguration, Handshake, HandshakeIntent, KeepAlive, LoginAcknowledged,
            LoginStart, LoginSuccess,
        },
        Capability, CompressionThreshold, ConnectionState, DecodedPacket, Direction, Packet,
        PacketRegistry, ProtocolVersion,
    },
    server,
    session::Session,
    transport::{BoxedTransport, Connector},
    ProxyBuilder, ProxyConfig, ProxyContext, SwitchError,
};
use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{duplex, DuplexStream},
    time::timeout,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);
const PIPE_CAPACITY: usize = 1 << 16;

pub fn address(server: &str) -> String {
    format!("{server}.test:25565")
}

/// An offline-mode configuration with `lobby`, `survival` and `void`
/// servers, trying `lobby` and then `survival`.
pub fn config() -> ProxyConfig {
    ProxyConfig {
        online_mode: false,
        compression_threshold: -1,
        servers: ["lobby", "survival", "void"]
            .into_iter()
            .map(|name| (name.to_owned(), address(name)))
            .collect(),
        try_servers: vec!["lobby".to_owned(), "survival".to_owned()],
        connect_timeout_ms: 1_000,
        login_timeout_ms: 2_000,
        switch_timeout_ms: 3_000,
        read_timeout_ms: 0,
        ..ProxyConfig::default()
    }
}

/// Hands one end of a fresh pipe to whichever mock backend owns the address.
#[derive(Default, Clone)]
pub struct DuplexConnector {
    backends: Arc<Mutex<HashMap<String, flume::Sender<DuplexStream>>>>,
}

impl DuplexConnector {
    fn listen(&self, address: String) -> flume::Receiver<DuplexStream> {
        let (tx, rx) = flume::unbounded();
        self.backends.lock().unwrap().insert(address, tx);
        rx
    }
}

impl Connector for DuplexConnector {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, io::Result<BoxedTransport>> {
        Box::pin(async move {
            let backend = self.backends.lock().unwrap().get(address).cloned();
            let Some(backend) = backend else {
                return Err(io::ErrorKind::ConnectionRefused.into());
            };
            let (near, far) = duplex(PIPE_CAPACITY);
            backend
                .send(far)
                .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
            Ok(Box::new(near) as BoxedTransport)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SwitchCompleted {
        previous: Option<String>,
        server: String,
    },
    SwitchFailed {
        target: String,
        error: String,
    },
    Brand(String),
    ChannelsRegistered(Vec<String>),
    ChannelsUnregistered(Vec<String>),
    Disconnected(LoginStatus),
}

#[derive(Default, Clone)]
pub struct Events(Arc<Mutex<Vec<Event>>>);

impl Events {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    /// Waits until an event matching `predicate` has been recorded.
    pub async fn wait_for(&self, predicate: impl Fn(&Event) -> bool) -> Event {
        let found = timeout(TIMEOUT, async {
            loop {
                if let Some(event) = self.all().into_iter().find(|e| predicate(e)) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("event never happened; saw {:?}", self.all()))
    }
}

pub const SECRET_CHANNEL: &str = "example:secret";
/// Keep-alives with this id are rewritten to `REWRITTEN_KEEP_ALIVE`.
pub const REWRITE_KEEP_ALIVE: i64 = 999;
pub const REWRITTEN_KEEP_ALIVE: i64 = 1_000;

/// Records events, denies switches to a fixed set of servers, drops
/// packets on [`SECRET_CHANNEL`] and rewrites one keep-alive id.
pub struct RecordingHooks {
    events: Events,
    denied: Vec<String>,
}

impl ProxyHooks for RecordingHooks {
    fn on_packet(
        &self,
        _session: &Session,
        _direction: Direction,
        packet: &DecodedPacket,
    ) -> PacketAction {
        match packet.known() {
            Some(Packet::PluginMessage(message)) if message.channel == SECRET_CHANNEL => {
                PacketAction::Drop
            }
            Some(Packet::KeepAlive(KeepAlive { id: REWRITE_KEEP_ALIVE })) => {
                PacketAction::Replace(
                    KeepAlive {
                        id: REWRITTEN_KEEP_ALIVE,
                    }
                    .into(),
                )
            }
            _ => PacketAction::Forward,
        }
    }

    fn on_switch_requested(&self, _session: &Session, target: &str) -> SwitchDecision {
        if self.denied.iter().any(|denied| denied == target) {
            SwitchDecision::Denied(format!("{target} is closed"))
        } else {
            SwitchDecision::Allowed
        }
    }

    fn on_switch_completed(&self, _session: &Session, previous: Option<&str>, server: &str) {
        self.events.push(Event::SwitchCompleted {
            previous: previous.map(str::to_owned),
            server: server.to_owned(),
        });
    }

    fn on_switch_failed(&self, _session: &Session, target: &str, error: &SwitchError) {
        self.events.push(Event::SwitchFailed {
            target: target.to_owned(),
            error: error.to_string(),
        });
    }

    fn on_client_brand(&self, _session: &Session, brand: &str) {
        self.events.push(Event::Brand(brand.to_owned()));
    }

    fn on_channels_registered(&self, _session: &Session, channels: &[String]) {
        self.events.push(Event::ChannelsRegistered(channels.to_vec()));
    }

    fn on_channels_unregistered(&self, _session: &Session, channels: &[String]) {
        self.events.push(Event::ChannelsUnregistered(channels.to_vec()));
    }

    fn on_disconnect(&self, _session: &Session, status: LoginStatus) {
        self.events.push(Event::Disconnected(status));
    }
}

pub struct TestProxy {
    pub ctx: Arc<ProxyContext>,
    pub events: Events,
    backends: HashMap<String, flume::Receiver<DuplexStream>>,
}

impl TestProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self::build(config, Vec::new(), |builder| builder)
    }

    pub fn with_denied(config: ProxyConfig, denied: &[&str]) -> Self {
        let denied = denied.iter().map(|s| s.to_string()).collect();
        Self::build(config, denied, |builder| builder)
    }

    pub fn with_authenticator(config: ProxyConfig, authenticator: impl Authenticator) -> Self {
        Self::build(config, Vec::new(), |builder| builder.authenticator(authenticator))
    }

    fn build(
        config: ProxyConfig,
        denied: Vec<String>,
        customize: impl FnOnce(ProxyBuilder) -> ProxyBuilder,
    ) -> Self {
        let connector = DuplexConnector::default();
        let backends = config
            .servers
            .iter()
            .map(|(name, address)| (name.clone(), connector.listen(address.clone())))
            .collect();
        let events = Events::default();
        let hooks = RecordingHooks {
            events: events.clone(),
            denied,
        };
        let builder = ProxyBuilder::new(config).connector(connector).hooks(hooks);
        let ctx = customize(builder).build().expect("valid test configuration");
        Self {
            ctx,
            events,
            backends,
        }
    }

    /// A client connection to the proxy, before the handshake.
    pub fn open_client(&self, version: ProtocolVersion) -> Connection {
        let (near, far) = duplex(PIPE_CAPACITY);
        let ctx = Arc::clone(&self.ctx);
        let remote_address: SocketAddr = "203.0.113.7:50000".parse().unwrap();
        tokio::spawn(async move {
            server::handle_connection(ctx, Box::new(far), Some(remote_address))
                .await
                .ok();
        });
        client_connection(Box::new(near), version)
    }

    /// A client that has logged in offline and is waiting for its first backend.
    pub async fn connect_client(&self, version: ProtocolVersion, name: &str) -> Connection {
        let mut client = self.open_client(version);
        handshake(&mut client, HandshakeIntent::Login).await;
        let success = offline_login(&mut client, name).await;
        assert_eq!(success.username, name);
        client
    }

    /// Accepts the proxy's next connection to `server` and logs it in.
    pub async fn accept(&self, server: &str) -> MockBackend {
        let mut backend = self.accept_login_start(server).await;
        backend.complete_login().await;
        backend
    }

    /// Accepts the proxy's next connection to `server`, stopping after LoginStart.
    pub async fn accept_login_start(&self, server: &str) -> MockBackend {
        let incoming = &self.backends[server];
        let stream = timeout(TIMEOUT, incoming.recv_async())
            .await
            .unwrap_or_else(|_| panic!("proxy never connected to {server}"))
            .unwrap();
        let mut conn = Connection::new(
            Box::new(stream),
            Side::Server,
            PacketRegistry::global(),
            ConnectionOptions::default(),
        );
        let handshake = match recv_known(&mut conn).await {
            Packet::Handshake(handshake) => handshake,
            other => panic!("expected a handshake, got {other:?}"),
        };
        conn.set_version(ProtocolVersion::new(handshake.protocol_version));
        conn.set_state(ConnectionState::Login).unwrap();
        let login_start = match recv_known(&mut conn).await {
            Packet::LoginStart(start) => start,
            other => panic!("expected LoginStart, got {other:?}"),
        };
        MockBackend {
            conn,
            handshake,
            login_start,
        }
    }

    pub fn session(&self, name: &str) -> Arc<Session> {
        self.ctx
            .sessions()
            .find_by_name(name)
            .unwrap_or_else(|| panic!("{name} has no session"))
    }

    /// Logs `name` in and connects them to `lobby`, ready to play.
    pub async fn join(&self, version: ProtocolVersion, name: &str) -> (Connection, MockBackend) {
        let mut client = self.connect_client(version, name).await;
        let mut lobby = self.accept("lobby").await;
        if is_modern(version) {
            configure(&mut client, &mut lobby).await;
        }
        lobby.conn.write_packet(join_game(1)).await.unwrap();
        recv_until(&mut client, |p| matches!(p, DecodedPacket::Known(Packet::JoinGame(_)))).await;
        self.events
            .wait_for(|e| matches!(e, Event::SwitchCompleted { previous: None, .. }))
            .await;
        (client, lobby)
    }

    /// Moves a playing modern client to `target`, driving both mock ends.
    pub async fn switch_modern(
        &self,
        client: &mut Connection,
        name: &str,
        target: &str,
    ) -> MockBackend {
        let ctx = Arc::clone(&self.ctx);
        let session = self.session(name);
        let target_owned = target.to_owned();
        let switch = tokio::spawn(async move {
            minecraft_relay::initiate_switch(&ctx, &session, &target_owned).await
        });
        let mut backend = self.accept(target).await;
        enter_configuration(client).await;
        configure(client, &mut backend).await;
        switch.await.unwrap().unwrap();
        backend
    }
}

pub fn is_modern(version: ProtocolVersion) -> bool {
    version.supports(Capability::ConfigurationState)
}

pub fn join_game(marker: u8) -> Packet {
    minecraft_relay::protocol::packet::JoinGame {
        data: vec![marker; 8],
    }
    .into()
}

fn client_connection(transport: BoxedTransport, version: ProtocolVersion) -> Connection {
    let mut conn = Connection::new(
        transport,
        Side::Client,
        PacketRegistry::global(),
        ConnectionOptions::default(),
    );
    conn.set_version(version);
    conn
}

pub async fn handshake(client: &mut Connection, intent: HandshakeIntent) {
    client
        .write_packet(Handshake {
            protocol_version: client.version().id(),
            server_address: "play.example.com".to_owned(),
            server_port: 25577,
            intent,
        })
        .await
        .unwrap();
    let next = match intent {
        HandshakeIntent::Status => ConnectionState::Status,
        HandshakeIntent::Login | HandshakeIntent::Transfer => ConnectionState::Login,
    };
    client.set_state(next).unwrap();
}

/// Logs in against an offline-mode proxy, following SetCompression.
pub async fn offline_login(client: &mut Connection, name: &str) -> LoginSuccess {
    client
        .write_packet(LoginStart {
            username: name.to_owned(),
            uuid: Some(minecraft_relay::auth::offline_uuid(name)),
        })
        .await
        .unwrap();
    let success = loop {
        match recv_known(client).await {
            Packet::SetCompression(compression) => {
                if let Some(threshold) = CompressionThreshold::new(compression.threshold) {
                    client.enable_compression(threshold).unwrap();
                }
            }
            Packet::LoginSuccess(success) => break success,
            other => panic!("unexpected {other:?} during login"),
        }
    };
    finish_login(client).await;
    success
}

pub async fn finish_login(client: &mut Connection) {
    if is_modern(client.version()) {
        client.write_packet(LoginAcknowledged).await.unwrap();
        client.set_state(ConnectionState::Configuration).unwrap();
    } else {
        client.set_state(ConnectionState::Play).unwrap();
    }
}

pub struct MockBackend {
    pub conn: Connection,
    pub handshake: Handshake,
    pub login_start: LoginStart,
}

impl MockBackend {
    pub async fn complete_login(&mut self) {
        let success = LoginSuccess {
            uuid: self.login_start.uuid.unwrap_or_default(),
            username: self.login_start.username.clone(),
            properties: Vec::new(),
            strict_error_handling: false,
        };
        self.conn.write_packet(success).await.unwrap();
        if is_modern(self.conn.version()) {
            match recv_known(&mut self.conn).await {
                Packet::LoginAcknowledged(_) => {}
                other => panic!("expected LoginAcknowledged, got {other:?}"),
            }
            self.conn.set_state(ConnectionState::Configuration).unwrap();
        } else {
            self.conn.set_state(ConnectionState::Play).unwrap();
        }
    }
}

/// Client side of StartConfiguration: acknowledges it and enters Configuration.
pub async fn enter_configuration(client: &mut Connection) {
    recv_until(client, |p| {
        matches!(p, DecodedPacket::Known(Packet::StartConfiguration(_)))
    })
    .await;
    client
        .write_packet(minecraft_relay::protocol::packet::AcknowledgeConfiguration)
        .await
        .unwrap();
    client.set_state(ConnectionState::Configuration).unwrap();
}

/// Runs a configuration phase between a client in Configuration and a
/// backend in Configuration, leaving both in Play. Returns what the
/// backend received.
pub async fn configure(client: &mut Connection, backend: &mut MockBackend) -> Vec<DecodedPacket> {
    backend.conn.write_packet(FinishConfiguration).await.unwrap();
    client_finish_configuration(client).await;
    let received = recv_until(&mut backend.conn, |p| {
        matches!(p, DecodedPacket::Known(Packet::FinishConfiguration(_)))
    })
    .await;
    backend.conn.set_state(ConnectionState::Play).unwrap();
    received
}

/// Waits for FinishConfiguration and answers it.
pub async fn client_finish_configuration(client: &mut Connection) {
    recv_until(client, |p| {
        matches!(p, DecodedPacket::Known(Packet::FinishConfiguration(_)))
    })
    .await;
    client.write_packet(FinishConfiguration).await.unwrap();
    client.set_state(ConnectionState::Play).unwrap();
}

pub async fn recv(conn: &mut Connection) -> DecodedPacket {
    timeout(TIMEOUT, conn.read_packet())
        .await
        .expect("timed out waiting for a packet")
        .expect("connection failed")
}

pub async fn recv_known(conn: &mut Connection) -> Packet {
    match recv(conn).await {
        DecodedPacket::Known(packet) => packet,
        other => panic!("expected a known packet, got {other:?}"),
    }
}

/// Reads until `predicate` matches. Returns everything read, the match last.
pub async fn recv_until(
    conn: &mut Connection,
    predicate: impl Fn(&DecodedPacket) -> bool,
) -> Vec<DecodedPacket> {
    let mut seen = Vec::new();
    loop {
        let packet = recv(conn).await;
        let done = predicate(&packet);
        seen.push(packet);
        if done {
            return seen;
        }
    }
}

/// Asserts the peer closes the connection.
pub async fn expect_closed(conn: &mut Connection) {
    let result = timeout(TIMEOUT, async {
        loop {
            if conn.read_packet().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "connection was never closed");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(TIMEOUT, future).await.expect("timed out")
}

/// Accepts every login, handing out a fixed profile per name.
#[derive(Default, Clone)]
pub struct TestAuthenticator {
    pub hashes: Arc<Mutex<Vec<String>>>,
}

impl Authenticator for TestAuthenticator {
    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        server_hash: &'a str,
    ) -> BoxFuture<'a, Result<GameProfile, AuthError>> {
        Box::pin(async move {
            self.hashes.lock().unwrap().push(server_hash.to_owned());
            Ok(GameProfile {
                id: uuid::Uuid::from_u128(0x1234),
                name: username.to_owned(),
                properties: Vec::new(),
            })
        })
    }
}
