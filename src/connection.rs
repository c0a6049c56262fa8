//! A single protocol connection, either to a client or to a backend.
//!
//! A [`Connection`] starts out in direct mode, where the owner reads and
//! writes packets one at a time. This is how the handshake and login
//! exchanges run. Once a connection reaches Configuration or Play it is
//! turned into a link with [`Connection::into_link`]: a reader task and a
//! writer task take over the transport, and the rest of the proxy talks to
//! them through a [`PacketSink`] and a [`PacketStream`].

use crate::{
    protocol::{
        packet::{Component, Disconnect, LoginDisconnect},
        CipherError, CodecError, CompressionThreshold, ConnectionState, DecodedPacket, Direction,
        EncryptionKey, InboundCodec, OutboundCodec, Packet, PacketCodec, PacketKind,
        PacketRegistry, ProtocolError, ProtocolVersion, RawPacket, StateCell, MAX_FRAME_LENGTH,
    },
    transport::BoxedTransport,
};
use bytes::Bytes;
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf},
    select,
    sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore},
    task,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Packet bodies the reader task may hold before it stops reading
/// from the transport.
const INBOUND_QUEUE_LENGTH: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id used in logs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the protocol the proxy plays on a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The proxy acts as the server; the peer is a player's client.
    Server,
    /// The proxy acts as the client; the peer is a backend server.
    Client,
}

impl Side {
    /// Direction of the packets this side receives.
    pub fn inbound(self) -> Direction {
        match self {
            Side::Server => Direction::Serverbound,
            Side::Client => Direction::Clientbound,
        }
    }

    pub fn outbound(self) -> Direction {
        self.inbound().opposite()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for the peer")]
    TimedOut,
}

/// Tunables shared by every connection the proxy opens.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_frame_length: usize,
    /// How long a read may wait for data before the peer is considered dead.
    pub read_timeout: Option<Duration>,
    /// Bytes that may be queued for writing before senders are suspended.
    pub write_high_water_mark: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
            read_timeout: Some(Duration::from_secs(30)),
            write_high_water_mark: 2 * 1024 * 1024,
        }
    }
}

/// The packet that tells the peer why it is being dropped, if the state has one.
fn disconnect_packet(
    state: ConnectionState,
    version: ProtocolVersion,
    reason: &str,
) -> Option<Packet> {
    match state {
        ConnectionState::Login => Some(LoginDisconnect::text(reason).into()),
        ConnectionState::Configuration | ConnectionState::Play => Some(
            Disconnect {
                reason: Component::text(reason, version),
            }
            .into(),
        ),
        ConnectionState::Handshake | ConnectionState::Status => None,
    }
}

/// The state a direction of a link moves to once `kind` has passed through it.
fn state_after(current: ConnectionState, kind: PacketKind) -> Option<ConnectionState> {
    match (current, kind) {
        (ConnectionState::Play, PacketKind::StartConfiguration)
        | (ConnectionState::Play, PacketKind::AcknowledgeConfiguration) => {
            Some(ConnectionState::Configuration)
        }
        (ConnectionState::Configuration, PacketKind::FinishConfiguration) => {
            Some(ConnectionState::Play)
        }
        _ => None,
    }
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut [u8],
    read_timeout: Option<Duration>,
) -> Result<usize, ConnectionError> {
    match read_timeout {
        Some(limit) => timeout(limit, reader.read(buffer))
            .await
            .map_err(|_| ConnectionError::TimedOut)?
            .map_err(ConnectionError::from),
        None => Ok(reader.read(buffer).await?),
    }
}

/// A connection in direct mode.
pub struct Connection {
    id: ConnectionId,
    side: Side,
    version: ProtocolVersion,
    state: ConnectionState,
    transport: BoxedTransport,
    codec: PacketCodec,
    registry: Arc<PacketRegistry>,
    options: ConnectionOptions,
    peer_address: Option<SocketAddr>,
    read_buffer: Box<[u8]>,
}

impl Connection {
    /// Wraps a fresh transport. The connection starts in the Handshake
    /// state speaking the newest version; the version is fixed once the
    /// handshake is known.
    pub fn new(
        transport: BoxedTransport,
        side: Side,
        registry: Arc<PacketRegistry>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            side,
            version: ProtocolVersion::LATEST,
            state: ConnectionState::Handshake,
            transport,
            codec: PacketCodec::new(options.max_frame_length),
            registry,
            options,
            peer_address: None,
            read_buffer: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn with_peer_address(mut self, peer_address: SocketAddr) -> Self {
        self.peer_address = Some(peer_address);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// Moves to `next`, rejecting transitions the version does not allow.
    pub fn set_state(&mut self, next: ConnectionState) -> Result<(), ProtocolError> {
        self.state = self.state.transition(next, self.version)?;
        tracing::debug!("Connection {}: transition to {next} state", self.id);
        Ok(())
    }

    pub fn enable_compression(
        &mut self,
        threshold: CompressionThreshold,
    ) -> Result<(), ConnectionError> {
        self.codec.enable_compression(threshold)?;
        tracing::debug!(
            "Connection {}: compression enabled at {} bytes",
            self.id,
            threshold.get()
        );
        Ok(())
    }

    pub fn enable_encryption(&mut self, key: EncryptionKey) -> Result<(), ConnectionError> {
        self.codec.enable_encryption(key)?;
        tracing::debug!("Connection {}: encryption enabled", self.id);
        Ok(())
    }

    /// Reads the next packet under the current version and state.
    pub async fn read_packet(&mut self) -> Result<DecodedPacket, ConnectionError> {
        loop {
            if let Some(body) = self.codec.inbound.next_body()? {
                let packet =
                    self.registry
                        .decode(self.version, self.state, self.side.inbound(), body)?;
                tracing::trace!("Connection {}: received {}", self.id, packet.describe());
                return Ok(packet);
            }

            let read = read_some(
                &mut self.transport,
                &mut self.read_buffer,
                self.options.read_timeout,
            )
            .await?;
            if read == 0 {
                return Err(ConnectionError::Closed);
            }
            self.codec.inbound.give_data(&mut self.read_buffer[..read]);
        }
    }

    /// Reads the next packet, treating packets without a codec as unexpected.
    pub async fn read_known(&mut self, expected: &'static str) -> Result<Packet, ConnectionError> {
        match self.read_packet().await? {
            DecodedPacket::Known(packet) => Ok(packet),
            other => Err(ProtocolError::UnexpectedPacket {
                expected,
                got: other.describe(),
            }
            .into()),
        }
    }

    pub async fn write_packet(&mut self, packet: impl Into<Packet>) -> Result<(), ConnectionError> {
        let packet = packet.into();
        let body = self
            .registry
            .encode(self.version, self.state, self.side.outbound(), &packet)?;
        self.write_body(&body).await?;
        tracing::trace!("Connection {}: sent {}", self.id, packet.kind().as_ref());
        Ok(())
    }

    pub async fn write_raw(&mut self, raw: &RawPacket) -> Result<(), ConnectionError> {
        self.write_body(&PacketRegistry::encode_raw(raw)).await
    }

    async fn write_body(&mut self, body: &[u8]) -> Result<(), ConnectionError> {
        let bytes = self.codec.outbound.encode_body(body)?;
        self.transport.write_all(&bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Sends the peer a readable reason if the state allows one, then
    /// closes the transport.
    pub async fn disconnect(mut self, reason: &str) {
        if self.side == Side::Server {
            if let Some(packet) = disconnect_packet(self.state, self.version, reason) {
                if let Err(e) = self.write_packet(packet).await {
                    tracing::debug!("Connection {}: failed to send disconnect: {e}", self.id);
                }
            }
        }
        self.transport.shutdown().await.ok();
    }

    /// Hands the transport to a reader task and a writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn into_link(self) -> (PacketSink, PacketStream) {
        let Connection {
            id,
            side,
            version,
            state,
            transport,
            codec,
            registry,
            options,
            peer_address,
            ..
        } = self;

        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            id,
            side,
            version,
            registry,
            peer_address,
            cancel: cancel.clone(),
        });

        let (inbound, outbound) = codec.split();
        let (reader, writer) = tokio::io::split(transport);
        let (bodies_tx, bodies_rx) = flume::bounded(INBOUND_QUEUE_LENGTH);
        let (commands_tx, commands_rx) = flume::unbounded();
        let high_water_mark = options.write_high_water_mark.max(1);
        let budget = Arc::new(Semaphore::new(high_water_mark));

        task::spawn(run_reader(
            reader,
            inbound,
            bodies_tx,
            cancel.clone(),
            options.read_timeout,
            id,
        ));
        task::spawn(run_writer(
            writer,
            outbound,
            commands_rx,
            cancel,
            Arc::clone(&budget),
            id,
        ));

        let sink = PacketSink {
            inner: Arc::new(SinkInner {
                shared: Arc::clone(&shared),
                state: StateCell::new(state),
                commands: commands_tx,
                budget,
                high_water_mark,
                send_lock: Mutex::new(()),
            }),
        };
        let stream = PacketStream {
            shared,
            state: Arc::new(StateCell::new(state)),
            bodies: bodies_rx,
        };
        (sink, stream)
    }
}

/// Fixed facts about a linked connection, shared by its sink and stream.
struct Shared {
    id: ConnectionId,
    side: Side,
    version: ProtocolVersion,
    registry: Arc<PacketRegistry>,
    peer_address: Option<SocketAddr>,
    cancel: CancellationToken,
}

enum WriteCommand {
    Body(Vec<u8>, OwnedSemaphorePermit),
    Flush(oneshot::Sender<()>),
    Close,
}

async fn run_reader(
    mut reader: ReadHalf<BoxedTransport>,
    mut codec: InboundCodec,
    bodies: flume::Sender<Result<Bytes, ConnectionError>>,
    cancel: CancellationToken,
    read_timeout: Option<Duration>,
    id: ConnectionId,
) {
    let result = select! {
        _ = cancel.cancelled() => Ok(()),
        result = read_bodies(&mut reader, &mut codec, &bodies, read_timeout) => result,
    };
    if let Err(e) = result {
        tracing::debug!("Connection {id}: read side failed: {e}");
        select! {
            _ = cancel.cancelled() => {}
            _ = bodies.send_async(Err(e)) => {}
        }
    }
    cancel.cancel();
}

async fn read_bodies(
    reader: &mut ReadHalf<BoxedTransport>,
    codec: &mut InboundCodec,
    bodies: &flume::Sender<Result<Bytes, ConnectionError>>,
    read_timeout: Option<Duration>,
) -> Result<(), ConnectionError> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        while let Some(body) = codec.next_body()? {
            if bodies.send_async(Ok(body)).await.is_err() {
                return Ok(());
            }
        }

        let read = read_some(reader, &mut buffer, read_timeout).await?;
        if read == 0 {
            return Ok(());
        }
        codec.give_data(&mut buffer[..read]);
    }
}

async fn run_writer(
    writer: WriteHalf<BoxedTransport>,
    mut codec: OutboundCodec,
    commands: flume::Receiver<WriteCommand>,
    cancel: CancellationToken,
    budget: Arc<Semaphore>,
    id: ConnectionId,
) {
    let mut writer = BufWriter::new(writer);
    let result = select! {
        _ = cancel.cancelled() => Ok(()),
        result = write_frames(&mut writer, &mut codec, &commands) => result,
    };
    if let Err(e) = result {
        tracing::debug!("Connection {id}: write side failed: {e}");
    }
    budget.close();
    cancel.cancel();
    writer.shutdown().await.ok();
}

async fn write_frames(
    writer: &mut BufWriter<WriteHalf<BoxedTransport>>,
    codec: &mut OutboundCodec,
    commands: &flume::Receiver<WriteCommand>,
) -> Result<(), ConnectionError> {
    while let Ok(command) = commands.recv_async().await {
        match command {
            WriteCommand::Body(body, permit) => {
                let bytes = codec.encode_body(&body)?;
                writer.write_all(&bytes).await?;
                drop(permit);
                if commands.is_empty() {
                    writer.flush().await?;
                }
            }
            WriteCommand::Flush(done) => {
                writer.flush().await?;
                done.send(()).ok();
            }
            WriteCommand::Close => {
                writer.flush().await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

struct SinkInner {
    shared: Arc<Shared>,
    state: StateCell,
    commands: flume::Sender<WriteCommand>,
    budget: Arc<Semaphore>,
    high_water_mark: usize,
    /// Keeps encoding, state tracking and queueing atomic across senders.
    send_lock: Mutex<()>,
}

/// Sending half of a linked connection. Cheap to clone.
///
/// Sends complete once the packet is queued for the writer task. They
/// suspend while more than the high-water mark of bytes is queued, which
/// is what makes a forwarding loop stop reading its own side.
#[derive(Clone)]
pub struct PacketSink {
    inner: Arc<SinkInner>,
}

impl PacketSink {
    pub fn id(&self) -> ConnectionId {
        self.inner.shared.id
    }

    pub fn version(&self) -> ProtocolVersion {
        self.inner.shared.version
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.inner.shared.peer_address
    }

    /// State packets are currently encoded under.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.cancel.is_cancelled()
    }

    /// Completes once either task of the connection has stopped.
    pub async fn closed(&self) {
        self.inner.shared.cancel.cancelled().await
    }

    pub async fn send(&self, packet: impl Into<Packet>) -> Result<(), ConnectionError> {
        let packet = packet.into();
        let shared = &self.inner.shared;
        let _guard = self.inner.send_lock.lock().await;

        let state = self.inner.state.load();
        let body = shared
            .registry
            .encode(shared.version, state, shared.side.outbound(), &packet)?;
        self.enqueue(body).await?;

        if let Some(next) = state_after(state, packet.kind()) {
            self.inner.state.store(next);
            tracing::debug!("Connection {}: outbound transition to {next} state", shared.id);
        }
        Ok(())
    }

    pub async fn send_raw(&self, raw: &RawPacket) -> Result<(), ConnectionError> {
        let _guard = self.inner.send_lock.lock().await;
        self.enqueue(PacketRegistry::encode_raw(raw)).await
    }

    /// Sends a packet received from another connection.
    pub async fn forward(&self, packet: DecodedPacket) -> Result<(), ConnectionError> {
        match packet {
            DecodedPacket::Known(packet) => self.send(packet).await,
            DecodedPacket::Opaque(raw) => self.send_raw(&raw).await,
        }
    }

    async fn enqueue(&self, body: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let cost = body.len().clamp(1, self.inner.high_water_mark);
        let cost = u32::try_from(cost).unwrap_or(u32::MAX);
        let permit = Arc::clone(&self.inner.budget)
            .acquire_many_owned(cost)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        self.inner
            .commands
            .send(WriteCommand::Body(body, permit))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Waits until everything queued so far has been handed to the transport.
    pub async fn flush(&self) -> Result<(), ConnectionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inner
            .commands
            .send(WriteCommand::Flush(done_tx))
            .map_err(|_| ConnectionError::Closed)?;
        done_rx.await.map_err(|_| ConnectionError::Closed)
    }

    /// Writes out what is queued, then closes the connection.
    pub fn close(&self) {
        if self.inner.commands.send(WriteCommand::Close).is_err() {
            self.inner.shared.cancel.cancel();
        }
    }

    /// Sends a readable reason (to clients only) and closes.
    pub async fn disconnect(&self, reason: &str) {
        let shared = &self.inner.shared;
        if shared.side == Side::Server {
            if let Some(packet) = disconnect_packet(self.state(), shared.version, reason) {
                if let Err(e) = self.send(packet).await {
                    tracing::debug!("Connection {}: failed to send disconnect: {e}", shared.id);
                }
            }
        }
        self.close();
    }
}

/// Receiving half of a linked connection.
///
/// Clones share the queue and the inbound state; only one of them
/// should be receiving at a time.
#[derive(Clone)]
pub struct PacketStream {
    shared: Arc<Shared>,
    state: Arc<StateCell>,
    bodies: flume::Receiver<Result<Bytes, ConnectionError>>,
}

impl PacketStream {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// State received packets are decoded under.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state);
    }

    /// Receives the next packet. Returns `None` once the connection is closed
    /// and every packet read before that has been received.
    pub async fn recv(&self) -> Result<Option<DecodedPacket>, ConnectionError> {
        let body = match self.bodies.recv_async().await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(None),
        };

        let shared = &self.shared;
        let state = self.state.load();
        let packet = shared
            .registry
            .decode(shared.version, state, shared.side.inbound(), body)?;
        if let DecodedPacket::Known(known) = &packet {
            if let Some(next) = state_after(state, known.kind()) {
                self.state.store(next);
                tracing::debug!("Connection {}: inbound transition to {next} state", shared.id);
            }
        }
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{
        AcknowledgeConfiguration, FinishConfiguration, KeepAlive, PluginMessage,
        StartConfiguration,
    };
    use tokio::io::duplex;

    fn pair(version: ProtocolVersion, capacity: usize) -> (Connection, Connection) {
        let (a, b) = duplex(capacity);
        let registry = PacketRegistry::global();
        let mut server = Connection::new(
            Box::new(a),
            Side::Server,
            Arc::clone(&registry),
            ConnectionOptions::default(),
        );
        let mut client = Connection::new(Box::new(b), Side::Client, registry, ConnectionOptions::default());
        server.set_version(version);
        client.set_version(version);
        (server, client)
    }

    fn enter_play(connection: &mut Connection) {
        connection.set_state(ConnectionState::Login).unwrap();
        connection.set_state(ConnectionState::Play).unwrap();
    }

    #[tokio::test]
    async fn direct_mode_survives_compression_and_encryption() {
        let (mut server, mut client) = pair(ProtocolVersion::V1_12_2, 1 << 16);
        enter_play(&mut server);
        enter_play(&mut client);

        let key = EncryptionKey::new([9; 16]);
        server.enable_compression(CompressionThreshold::new(64).unwrap()).unwrap();
        server.enable_encryption(key).unwrap();
        client.enable_compression(CompressionThreshold::new(64).unwrap()).unwrap();
        client.enable_encryption(key).unwrap();

        let big = PluginMessage::new("test:big", vec![7; 500]);
        server.write_packet(big.clone()).await.unwrap();
        server.write_packet(KeepAlive { id: 3 }).await.unwrap();

        assert_eq!(
            client.read_packet().await.unwrap(),
            DecodedPacket::Known(big.into())
        );
        assert_eq!(
            client.read_packet().await.unwrap(),
            DecodedPacket::Known(KeepAlive { id: 3 }.into())
        );
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let (mut server, _client) = pair(ProtocolVersion::V1_16_4, 64);
        server.set_state(ConnectionState::Login).unwrap();
        assert!(server.set_state(ConnectionState::Configuration).is_err());
        assert_eq!(server.state(), ConnectionState::Login);
    }

    #[tokio::test]
    async fn link_preserves_order() {
        let (mut server, mut client) = pair(ProtocolVersion::V1_20_3, 1 << 16);
        enter_play_modern(&mut server);
        enter_play_modern(&mut client);
        let (sink, _stream) = server.into_link();
        let (_client_sink, client_stream) = client.into_link();

        for id in 0..500 {
            sink.send(KeepAlive { id }).await.unwrap();
        }
        for id in 0..500 {
            let packet = client_stream.recv().await.unwrap().unwrap();
            assert_eq!(packet, DecodedPacket::Known(KeepAlive { id }.into()));
        }
    }

    fn enter_play_modern(connection: &mut Connection) {
        connection.set_state(ConnectionState::Login).unwrap();
        connection.set_state(ConnectionState::Configuration).unwrap();
        connection.set_state(ConnectionState::Play).unwrap();
    }

    #[tokio::test]
    async fn link_tracks_configuration_packets() {
        let (mut server, mut client) = pair(ProtocolVersion::V1_20_3, 1 << 16);
        enter_play_modern(&mut server);
        enter_play_modern(&mut client);
        let (server_sink, server_stream) = server.into_link();
        let (client_sink, client_stream) = client.into_link();

        server_sink.send(StartConfiguration).await.unwrap();
        assert_eq!(server_sink.state(), ConnectionState::Configuration);
        client_stream.recv().await.unwrap().unwrap();
        assert_eq!(client_stream.state(), ConnectionState::Configuration);

        client_sink.send(AcknowledgeConfiguration).await.unwrap();
        assert_eq!(client_sink.state(), ConnectionState::Configuration);
        server_stream.recv().await.unwrap().unwrap();
        assert_eq!(server_stream.state(), ConnectionState::Configuration);

        server_sink.send(FinishConfiguration).await.unwrap();
        client_stream.recv().await.unwrap().unwrap();
        client_sink.send(FinishConfiguration).await.unwrap();
        server_stream.recv().await.unwrap().unwrap();
        for state in [
            server_sink.state(),
            server_stream.state(),
            client_sink.state(),
            client_stream.state(),
        ] {
            assert_eq!(state, ConnectionState::Play);
        }
    }

    #[tokio::test]
    async fn full_write_queue_suspends_senders() {
        let (mut server, mut client) = pair(ProtocolVersion::V1_20_3, 64);
        enter_play_modern(&mut server);
        enter_play_modern(&mut client);
        server.options.write_high_water_mark = 256;
        let (sink, _stream) = server.into_link();

        let packet = PluginMessage::new("test:fill", vec![0; 100]);
        let mut suspended = false;
        for _ in 0..16 {
            if timeout(Duration::from_millis(100), sink.send(packet.clone()))
                .await
                .is_err()
            {
                suspended = true;
                break;
            }
        }
        assert!(suspended);

        // Draining the peer releases the queue.
        let (_client_sink, client_stream) = client.into_link();
        client_stream.recv().await.unwrap().unwrap();
        timeout(Duration::from_secs(5), sink.send(packet))
            .await
            .expect("queue drained")
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_uses_the_state_packet() {
        let (mut server, mut client) = pair(ProtocolVersion::V1_20_3, 1 << 16);
        server.set_state(ConnectionState::Login).unwrap();
        client.set_state(ConnectionState::Login).unwrap();
        server.disconnect("bye").await;

        match client.read_known("a disconnect").await.unwrap() {
            Packet::LoginDisconnect(packet) => assert!(packet.reason.contains("bye")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            client.read_packet().await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn peer_close_ends_the_stream() {
        let (mut server, mut client) = pair(ProtocolVersion::V1_8, 1024);
        enter_play(&mut server);
        enter_play(&mut client);
        let (sink, stream) = server.into_link();
        drop(client);

        assert!(stream.recv().await.unwrap().is_none());
        sink.closed().await;
        assert!(sink.is_closed());
        assert!(matches!(
            sink.send(KeepAlive { id: 1 }).await,
            Err(ConnectionError::Closed)
        ));
    }
}
