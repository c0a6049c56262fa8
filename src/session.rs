//! Sessions: one per logged-in player, holding the client link and
//! whichever backend the player is currently on.

use crate::{
    auth::GameProfile,
    connection::{PacketSink, PacketStream},
    pipeline::{LoopCommand, LoopHandle},
    protocol::{packet::ClientSettings, ProtocolVersion},
    switch::SwitchError,
};
use ahash::AHashSet;
use arc_swap::ArcSwapOption;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The backend a session is currently relaying to.
pub struct BackendLink {
    server: String,
    sink: PacketSink,
    downstream: LoopHandle,
}

impl BackendLink {
    pub(crate) fn new(server: String, sink: PacketSink, downstream: LoopHandle) -> Self {
        Self {
            server,
            sink,
            downstream,
        }
    }

    /// Configured name of the server.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn sink(&self) -> &PacketSink {
        &self.sink
    }

    pub(crate) fn downstream(&self) -> &LoopHandle {
        &self.downstream
    }

    pub fn is_alive(&self) -> bool {
        !self.sink.is_closed()
    }

    /// Stops relaying from the backend and closes the connection once
    /// everything already queued for it is written.
    pub(crate) fn close(&self) {
        self.downstream.stop();
        self.sink.close();
    }
}

pub struct Session {
    profile: GameProfile,
    version: ProtocolVersion,
    remote_address: Option<SocketAddr>,
    virtual_host: String,
    client: PacketSink,
    client_stream: PacketStream,
    upstream: LoopHandle,
    backend: ArcSwapOption<BackendLink>,
    switching: AtomicBool,
    pending_target: Mutex<Option<String>>,
    settings: ArcSwapOption<ClientSettings>,
    brand: ArcSwapOption<String>,
    channels: Mutex<AHashSet<String>>,
    /// Reason to disconnect the client with, once its upstream loop gets to it.
    pending_kick: Mutex<Option<String>>,
    joined: AtomicBool,
    kicked: AtomicBool,
    ended: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session around a linked client connection. The returned
    /// receiver drives the session's upstream loop.
    pub(crate) fn new(
        profile: GameProfile,
        remote_address: Option<SocketAddr>,
        virtual_host: String,
        client: PacketSink,
        client_stream: PacketStream,
    ) -> (Arc<Self>, flume::Receiver<LoopCommand>) {
        let (upstream, commands) = LoopHandle::new();
        let session = Arc::new(Self {
            profile,
            version: client.version(),
            remote_address,
            virtual_host,
            client,
            client_stream,
            upstream,
            backend: ArcSwapOption::empty(),
            switching: AtomicBool::new(false),
            pending_target: Mutex::new(None),
            settings: ArcSwapOption::empty(),
            brand: ArcSwapOption::empty(),
            channels: Mutex::new(AHashSet::new()),
            pending_kick: Mutex::new(None),
            joined: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (session, commands)
    }

    pub fn profile(&self) -> &GameProfile {
        &self.profile
    }

    pub fn id(&self) -> Uuid {
        self.profile.id
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// Host name the client used to reach the proxy.
    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn client(&self) -> &PacketSink {
        &self.client
    }

    pub(crate) fn client_stream(&self) -> &PacketStream {
        &self.client_stream
    }

    pub(crate) fn upstream(&self) -> &LoopHandle {
        &self.upstream
    }

    pub fn backend(&self) -> Option<Arc<BackendLink>> {
        self.backend.load_full()
    }

    pub fn current_server(&self) -> Option<String> {
        self.backend
            .load()
            .as_ref()
            .map(|link| link.server().to_owned())
    }

    /// Whether the session has no backend or its backend has closed.
    pub fn backend_is_dead(&self) -> bool {
        self.backend
            .load()
            .as_ref()
            .map_or(true, |link| !link.is_alive())
    }

    pub(crate) fn swap_backend(&self, link: Option<Arc<BackendLink>>) -> Option<Arc<BackendLink>> {
        self.backend.swap(link)
    }

    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::Acquire)
    }

    pub fn pending_target(&self) -> Option<String> {
        lock(&self.pending_target).clone()
    }

    /// Claims the session's switch slot until the guard is dropped.
    pub(crate) fn begin_switch(&self, target: &str) -> Result<SwitchGuard<'_>, SwitchError> {
        self.switching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SwitchError::AlreadySwitching)?;
        *lock(&self.pending_target) = Some(target.to_owned());
        Ok(SwitchGuard { session: self })
    }

    pub fn settings(&self) -> Option<Arc<ClientSettings>> {
        self.settings.load_full()
    }

    pub(crate) fn set_settings(&self, settings: ClientSettings) {
        self.settings.store(Some(Arc::new(settings)));
    }

    pub fn brand(&self) -> Option<Arc<String>> {
        self.brand.load_full()
    }

    pub(crate) fn set_brand(&self, brand: String) {
        self.brand.store(Some(Arc::new(brand)));
    }

    /// Plugin channels the client has registered, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = lock(&self.channels).iter().cloned().collect();
        channels.sort_unstable();
        channels
    }

    /// Fails without registering anything if the client would end up
    /// with more than [`MAX_CHANNELS`].
    pub(crate) fn add_channels(&self, channels: &[String]) -> Result<(), TooManyChannels> {
        let mut known = lock(&self.channels);
        let added = channels
            .iter()
            .filter(|channel| !known.contains(channel.as_str()))
            .collect::<AHashSet<_>>();
        if known.len() + added.len() > MAX_CHANNELS {
            return Err(TooManyChannels);
        }
        known.extend(added.into_iter().cloned());
        Ok(())
    }

    pub(crate) fn remove_channels(&self, channels: &[String]) {
        let mut known = lock(&self.channels);
        for channel in channels {
            known.remove(channel);
        }
    }

    /// Asks the upstream loop to disconnect the client with `reason`.
    pub(crate) fn kick_later(&self, reason: impl Into<String>) {
        lock(&self.pending_kick).get_or_insert_with(|| reason.into());
    }

    pub(crate) fn take_pending_kick(&self) -> Option<String> {
        lock(&self.pending_kick).take()
    }

    /// Whether the player has been connected to a backend at least once.
    pub fn has_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    pub(crate) fn mark_joined(&self) {
        self.joined.store(true, Ordering::Release);
    }

    pub(crate) fn was_kicked(&self) -> bool {
        self.kicked.load(Ordering::Acquire)
    }

    /// Marks the session as ended. Returns `false` if it already was.
    pub(crate) fn mark_ended(&self) -> bool {
        !self.ended.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.client.is_closed()
    }

    /// Completes once the client has gone or the session was closed.
    pub async fn closed(&self) {
        select! {
            _ = self.cancel.cancelled() => {}
            _ = self.client.closed() => {}
        }
    }

    /// Disconnects the player with a readable reason.
    pub async fn disconnect(&self, reason: &str) {
        self.kicked.store(true, Ordering::Release);
        self.client.disconnect(reason).await;
        self.cancel.cancel();
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Releases the switch slot on drop.
pub(crate) struct SwitchGuard<'a> {
    session: &'a Session,
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.session.pending_target) = None;
        self.session.switching.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Most plugin channels one client may register.
pub const MAX_CHANNELS: usize = 1024;

#[derive(Debug, thiserror::Error)]
#[error("too many plugin channels (the limit is {MAX_CHANNELS})")]
pub struct TooManyChannels;

#[derive(Debug, thiserror::Error)]
#[error("{0} is already connected")]
pub struct AlreadyConnected(pub String);

/// Every live session, by UUID and by lowercase name.
#[derive(Default)]
pub struct SessionManager {
    by_id: DashMap<Uuid, Arc<Session>>,
    by_name: DashMap<String, Uuid>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) -> Result<(), AlreadyConnected> {
        let name = session.name().to_lowercase();
        // Both entries stay locked until both are filled, always name first.
        let Entry::Vacant(name_slot) = self.by_name.entry(name) else {
            return Err(AlreadyConnected(session.name().to_owned()));
        };
        let Entry::Vacant(id_slot) = self.by_id.entry(session.id()) else {
            return Err(AlreadyConnected(session.name().to_owned()));
        };
        name_slot.insert(session.id());
        id_slot.insert(session);
        Ok(())
    }

    /// Removes `session`, leaving any newer session with the same identity alone.
    pub fn unregister(&self, session: &Arc<Session>) {
        let removed = self
            .by_id
            .remove_if(&session.id(), |_, existing| Arc::ptr_eq(existing, session));
        if removed.is_some() {
            self.by_name
                .remove_if(&session.name().to_lowercase(), |_, id| *id == session.id());
        }
    }

    pub fn is_connected(&self, profile: &GameProfile) -> bool {
        self.by_id.contains_key(&profile.id)
            || self.by_name.contains_key(&profile.name.to_lowercase())
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.by_id.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Session>> {
        let id = *self.by_name.get(&name.to_lowercase())?;
        self.get(&id)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.by_id
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
