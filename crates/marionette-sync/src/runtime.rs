//! Async session runtime.
//!
//! [`SessionRuntime::create`] and [`SessionRuntime::join`] establish a
//! session over a [`Transport`] and spawn one actor task that owns the
//! [`Session`]. Channel pumps, asset loading and signaling recovery run as
//! separate tasks and report back through the actor's inbox, so all session
//! state changes happen on the actor's single timeline. The caller talks to
//! the actor through a [`SessionHandle`].

use std::collections::HashMap;
use std::fmt;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;

use marionette_net::{
    Admission, AssetKind, AvatarState, CancelToken, Channel, ChannelEvent, LatencySnapshot,
    PeerId, PeerRecord, ReconnectError, Reconnector, Registration, Role, RoomId, RouterObservers,
    SessionInfo, SessionStatus, SignalingState, Transport, TransportError, unix_millis,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{
    AssetSendError, RendererError, SessionCreateError, SessionEnded, SessionJoinError,
    TransferError,
};
use crate::session::{Session, SessionEvent, SessionOptions};
use crate::transfer::{ReassembledAsset, TransferProgress};

/// Queue depth for handle commands.
const COMMAND_CAPACITY: usize = 64;

/// Lower bound on the transfer timer period.
const MIN_TRANSFER_TICK: Duration = Duration::from_millis(5);

/// The embedding renderer.
pub trait Renderer: Send + Sync + 'static {
    /// Current local avatar sample, or `None` when no avatar is loaded.
    fn local_sampled_state(&self) -> Option<AvatarState>;

    /// A smoothed remote avatar state for the next frame.
    fn apply_remote_state(&self, peer: &PeerId, state: &AvatarState);

    /// Load a reassembled asset. Failure is logged and reported as transfer
    /// progress; it never affects the session.
    fn on_asset_reassembled(
        &self,
        peer: &PeerId,
        asset: AssetKind,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), RendererError>> + Send;
}

/// Receives every transfer progress report.
pub trait ProgressObserver: Send + Sync {
    /// One report.
    fn on_transfer_progress(&self, progress: &TransferProgress);
}

/// Builder for a session over `T`, rendering through `R`.
pub struct SessionRuntime<T: Transport, R: Renderer> {
    transport: Arc<T>,
    renderer: Arc<R>,
    options: SessionOptions,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl<T: Transport, R: Renderer> SessionRuntime<T, R> {
    /// Runtime with the given collaborators.
    pub fn new(transport: Arc<T>, renderer: Arc<R>, options: SessionOptions) -> Self {
        Self {
            transport,
            renderer,
            options,
            progress: None,
        }
    }

    /// Report transfer progress to `observer`.
    pub fn with_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Host a new room. The room id is the host's freshly generated peer id.
    pub async fn create(self, display_name: &str) -> Result<SessionHandle, SessionCreateError> {
        let local = PeerId::random("room");
        let mut session = Session::new(local.clone(), self.options.clone());
        session.begin_host(display_name)?;

        let timeout = self.options.connection.connect_timeout;
        let registration = match tokio::time::timeout(timeout, self.transport.register(&local)).await {
            Ok(Ok(registration)) => registration,
            Ok(Err(err)) => {
                session.fail();
                return Err(err.into());
            }
            Err(_) => {
                session.fail();
                self.transport.unregister(&local);
                return Err(SessionCreateError::Timeout(timeout));
            }
        };

        session.mark_connected();
        tracing::info!("Hosting room {} as {}", local, display_name);
        Ok(self.spawn(session, registration, None))
    }

    /// Join the room hosted by `room`.
    ///
    /// Succeeds once the host has answered on the new channel; a host that
    /// closes the channel instead (room full) rejects the join.
    pub async fn join(self, room: RoomId, display_name: &str) -> Result<SessionHandle, SessionJoinError> {
        let local = PeerId::random("peer");
        let mut session = Session::new(local.clone(), self.options.clone());
        session.begin_guest(room.clone(), display_name)?;

        let timeout = self.options.connection.connect_timeout;
        let deadline = Instant::now() + timeout;
        let result = self.admit(&mut session, &local, &room, deadline).await;
        match result {
            Ok((registration, channel)) => {
                session.mark_connected();
                tracing::info!("Joined room {} as {}", room, display_name);
                Ok(self.spawn(session, registration, Some(channel)))
            }
            Err(err) => {
                session.fail();
                self.transport.unregister(&local);
                tracing::warn!("Joining room {} failed: {}", room, err);
                Err(err)
            }
        }
    }

    async fn admit(
        &self,
        session: &mut Session,
        local: &PeerId,
        room: &RoomId,
        deadline: Instant,
    ) -> Result<(Registration, Channel), SessionJoinError> {
        let timeout = self.options.connection.connect_timeout;
        let connect = async {
            let registration = self.transport.register(local).await?;
            let channel = self.transport.connect(local, room).await?;
            Ok::<_, SessionJoinError>((registration, channel))
        };
        let (registration, mut channel) = tokio::time::timeout_at(deadline, connect)
            .await
            .map_err(|_| SessionJoinError::Timeout(timeout))??;

        session.on_channel_open(room.clone(), channel.handle.clone(), unix_millis());
        match tokio::time::timeout_at(deadline, channel.events.recv()).await {
            Ok(Some(ChannelEvent::Data(bytes))) => {
                session.on_channel_data(room, &bytes, unix_millis());
                Ok((registration, channel))
            }
            Ok(Some(ChannelEvent::Error(reason))) => Err(SessionJoinError::Rejected(reason)),
            Ok(Some(ChannelEvent::Closed)) | Ok(None) => Err(SessionJoinError::Rejected(
                "host closed the channel".to_string(),
            )),
            Err(_) => Err(SessionJoinError::Timeout(timeout)),
        }
    }

    fn spawn(self, session: Session, registration: Registration, room: Option<Channel>) -> SessionHandle {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let status = session.connections().status_watch().subscribe();
        let observers = session.connections().router().observers();
        let info = session.connections().session().cloned().unwrap_or_else(|| SessionInfo {
            room_id: session.local_peer_id().clone(),
            role: Role::Host,
            local_peer_id: session.local_peer_id().clone(),
            display_name: String::new(),
        });

        let mut actor = SessionActor {
            session,
            transport: self.transport,
            renderer: self.renderer,
            progress: self.progress,
            options: self.options,
            commands,
            inbox_tx,
            inbox,
            incoming: Some(registration.incoming),
            signaling: Some(registration.signaling),
            pumps: HashMap::new(),
            next_serial: 0,
            recovery: None,
            readmission: None,
            cancel: cancel.clone(),
            done: false,
        };
        if let Some(channel) = room {
            actor.start_pump(channel);
        }
        let task = tokio::spawn(actor.run());

        SessionHandle {
            info,
            status,
            observers,
            commands: commands_tx,
            cancel,
            task,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    SendAsset {
        peer: PeerId,
        asset: AssetKind,
        bytes: Arc<[u8]>,
        reply: oneshot::Sender<Result<TransferProgress, TransferError>>,
    },
    SetLocalAsset {
        asset: AssetKind,
        bytes: Option<Arc<[u8]>>,
    },
    Chat(String),
    Reaction(String),
    Peers(oneshot::Sender<Vec<PeerRecord>>),
    Avatars(oneshot::Sender<Vec<AvatarState>>),
    Latency(PeerId, oneshot::Sender<Option<LatencySnapshot>>),
    Leave(oneshot::Sender<usize>),
}

/// Caller's side of a running session.
pub struct SessionHandle {
    info: SessionInfo,
    status: watch::Receiver<SessionStatus>,
    observers: RouterObservers,
    commands: mpsc::Sender<Command>,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("info", &self.info)
            .field("status", &self.status())
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Room id to share with guests.
    pub fn room_id(&self) -> &RoomId {
        &self.info.room_id
    }

    /// Local peer id.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.info.local_peer_id
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.info.role
    }

    /// Local display name.
    pub fn display_name(&self) -> &str {
        &self.info.display_name
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Status subscription.
    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Message and connection observers of this session.
    pub fn observers(&self) -> &RouterObservers {
        &self.observers
    }

    /// Whether the session task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    async fn command(&self, command: Command) -> Result<(), SessionEnded> {
        self.commands.send(command).await.map_err(|_| SessionEnded)
    }

    async fn request<V>(&self, make: impl FnOnce(oneshot::Sender<V>) -> Command) -> Result<V, SessionEnded> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| SessionEnded)
    }

    /// Push an asset to `peer`.
    pub async fn send_asset(
        &self,
        peer: &PeerId,
        asset: AssetKind,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Result<TransferProgress, AssetSendError> {
        let bytes = bytes.into();
        let peer = peer.clone();
        let result = self
            .request(|reply| Command::SendAsset {
                peer,
                asset,
                bytes,
                reply,
            })
            .await?;
        Ok(result?)
    }

    /// Offer a local asset to peers, or withdraw it with `None`.
    pub async fn set_local_asset(&self, asset: AssetKind, bytes: Option<Vec<u8>>) -> Result<(), SessionEnded> {
        self.command(Command::SetLocalAsset {
            asset,
            bytes: bytes.map(Arc::from),
        })
        .await
    }

    /// Broadcast a chat line.
    pub async fn chat(&self, text: &str) -> Result<(), SessionEnded> {
        self.command(Command::Chat(text.to_string())).await
    }

    /// Broadcast a reaction.
    pub async fn react(&self, emoji: &str) -> Result<(), SessionEnded> {
        self.command(Command::Reaction(emoji.to_string())).await
    }

    /// Known peers, ghosts included.
    pub async fn peers(&self) -> Result<Vec<PeerRecord>, SessionEnded> {
        self.request(Command::Peers).await
    }

    /// Latest unfiltered states of every remote avatar.
    pub async fn avatars(&self) -> Result<Vec<AvatarState>, SessionEnded> {
        self.request(Command::Avatars).await
    }

    /// Heartbeat statistics for a direct peer.
    pub async fn latency(&self, peer: &PeerId) -> Result<Option<LatencySnapshot>, SessionEnded> {
        let peer = peer.clone();
        self.request(|reply| Command::Latency(peer, reply)).await
    }

    /// Announce departure and stop the session. Any reconnection in
    /// progress is abandoned.
    ///
    /// Returns how many peers were notified.
    pub async fn leave(self) -> Result<usize, SessionEnded> {
        let result = self.request(Command::Leave).await;
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!("Session task ended abnormally: {}", err);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Internal {
    Channel {
        peer: PeerId,
        serial: u64,
        event: Option<ChannelEvent>,
    },
    Loaded {
        asset: ReassembledAsset,
        result: Result<(), RendererError>,
    },
    Reconnecting(u32),
    Recovered {
        registration: Registration,
        room: Option<Channel>,
    },
    RecoveryFailed(ReconnectError),
}

struct Pump {
    serial: u64,
    task: JoinHandle<()>,
}

struct SessionActor<T: Transport, R: Renderer> {
    session: Session,
    transport: Arc<T>,
    renderer: Arc<R>,
    progress: Option<Arc<dyn ProgressObserver>>,
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    inbox_tx: mpsc::UnboundedSender<Internal>,
    inbox: mpsc::UnboundedReceiver<Internal>,
    incoming: Option<mpsc::Receiver<Channel>>,
    signaling: Option<watch::Receiver<SignalingState>>,
    pumps: HashMap<PeerId, Pump>,
    next_serial: u64,
    recovery: Option<JoinHandle<()>>,
    /// Serial of a recovered room channel still waiting for the host's
    /// first message.
    readmission: Option<u64>,
    cancel: CancelToken,
    done: bool,
}

async fn next_incoming(incoming: &mut Option<mpsc::Receiver<Channel>>) -> Option<Channel> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn next_signal(signaling: &mut Option<watch::Receiver<SignalingState>>) -> SignalingState {
    match signaling {
        Some(rx) => match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => SignalingState::Lost,
        },
        None => pending().await,
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Forward one channel's events to the actor until it closes.
async fn pump_channel(
    peer: PeerId,
    serial: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    inbox: mpsc::UnboundedSender<Internal>,
) {
    loop {
        let event = events.recv().await;
        let last = !matches!(event, Some(ChannelEvent::Data(_)));
        let delivered = inbox
            .send(Internal::Channel {
                peer: peer.clone(),
                serial,
                event,
            })
            .is_ok();
        if last || !delivered {
            break;
        }
    }
}

/// Re-establish signaling, and the room channel when `room` is set.
async fn reattach<T: Transport>(
    transport: Arc<T>,
    local: PeerId,
    room: Option<RoomId>,
    fresh: bool,
) -> Result<(Registration, Option<Channel>), TransportError> {
    let registration = if fresh {
        transport.unregister(&local);
        transport.register(&local).await?
    } else {
        transport.resume(&local).await?
    };
    let channel = match room {
        Some(room) => Some(transport.connect(&local, &room).await?),
        None => None,
    };
    Ok((registration, channel))
}

impl<T: Transport, R: Renderer> SessionActor<T, R> {
    async fn run(mut self) {
        let sync = self.options.sync.clone();
        let mut pose = ticker(sync.pose_interval);
        let mut expression = ticker(sync.expression_interval);
        let mut heartbeat = ticker(self.options.connection.heartbeat_interval);
        let mut transfer = ticker(self.options.transfer.chunk_delay.max(MIN_TRANSFER_TICK));

        while !self.done {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!("Session handle dropped; leaving");
                        self.session.leave();
                        self.done = true;
                    }
                },
                Some(internal) = self.inbox.recv() => self.on_internal(internal),
                channel = next_incoming(&mut self.incoming) => match channel {
                    Some(channel) => self.accept(channel),
                    None => self.incoming = None,
                },
                state = next_signal(&mut self.signaling) => self.on_signaling(state),
                _ = pose.tick() => {
                    let now = unix_millis();
                    let sampled = self.renderer.local_sampled_state();
                    self.session.pose_tick(now, sampled.as_ref());
                    for state in self.session.remote_states(now) {
                        self.renderer.apply_remote_state(&state.peer_id, &state);
                    }
                }
                _ = expression.tick() => {
                    let sampled = self.renderer.local_sampled_state();
                    self.session.expression_tick(unix_millis(), sampled.as_ref());
                }
                _ = heartbeat.tick() => {
                    self.session.heartbeat(unix_millis());
                }
                _ = transfer.tick() => self.session.transfer_tick(unix_millis()),
            }
            self.flush_events();
        }
        self.shutdown();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendAsset {
                peer,
                asset,
                bytes,
                reply,
            } => {
                let result = self.session.send_asset(&peer, asset, bytes, unix_millis());
                let _ = reply.send(result);
            }
            Command::SetLocalAsset { asset, bytes } => {
                self.session.set_local_asset(asset, bytes, unix_millis());
            }
            Command::Chat(text) => {
                self.session.send_chat(&text);
            }
            Command::Reaction(emoji) => {
                self.session.send_reaction(&emoji);
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.session.connections().peers().cloned().collect());
            }
            Command::Avatars(reply) => {
                let _ = reply.send(self.session.sync().avatars().remote().cloned().collect());
            }
            Command::Latency(peer, reply) => {
                let _ = reply.send(self.session.connections().latency(&peer));
            }
            Command::Leave(reply) => {
                let notified = self.session.leave();
                let _ = reply.send(notified);
                self.done = true;
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Channel { peer, serial, event } => {
                if self.pumps.get(&peer).map(|p| p.serial) != Some(serial) {
                    return;
                }
                let readmitting = self.readmission == Some(serial);
                if readmitting {
                    self.readmission = None;
                }
                let now = unix_millis();
                if readmitting && !matches!(event, Some(ChannelEvent::Data(_))) {
                    self.pumps.remove(&peer);
                    tracing::warn!("Room {} refused to re-admit us", peer);
                    self.session.on_channel_closed(&peer, now);
                    self.session.fail();
                    self.done = true;
                    return;
                }
                match event {
                    Some(ChannelEvent::Data(bytes)) => self.session.on_channel_data(&peer, &bytes, now),
                    Some(ChannelEvent::Error(reason)) => {
                        self.pumps.remove(&peer);
                        self.session.on_channel_error(&peer, &reason, now);
                        self.after_channel_lost(&peer);
                    }
                    Some(ChannelEvent::Closed) | None => {
                        self.pumps.remove(&peer);
                        self.session.on_channel_closed(&peer, now);
                        self.after_channel_lost(&peer);
                    }
                }
            }
            Internal::Loaded { asset, result } => self.session.asset_loaded(&asset, result),
            Internal::Reconnecting(attempt) => self.session.reconnecting(attempt),
            Internal::Recovered { registration, room } => {
                self.recovery = None;
                self.incoming = Some(registration.incoming);
                self.signaling = Some(registration.signaling);
                if let Some(channel) = room {
                    let admission =
                        self.session
                            .on_channel_open(channel.remote.clone(), channel.handle.clone(), unix_millis());
                    if admission == Admission::Accepted {
                        self.readmission = Some(self.start_pump(channel));
                    }
                }
                self.session.mark_connected();
            }
            Internal::RecoveryFailed(err) => {
                self.recovery = None;
                if err == ReconnectError::Cancelled {
                    return;
                }
                tracing::warn!("Giving up on session: {}", err);
                self.session.fail();
                self.done = true;
            }
        }
    }

    fn accept(&mut self, channel: Channel) {
        let admission = self
            .session
            .on_channel_open(channel.remote.clone(), channel.handle.clone(), unix_millis());
        if admission == Admission::Accepted {
            self.start_pump(channel);
        }
    }

    fn start_pump(&mut self, channel: Channel) -> u64 {
        self.next_serial += 1;
        let serial = self.next_serial;
        let task = tokio::spawn(pump_channel(
            channel.remote.clone(),
            serial,
            channel.events,
            self.inbox_tx.clone(),
        ));
        if let Some(previous) = self.pumps.insert(channel.remote, Pump { serial, task }) {
            previous.task.abort();
        }
        serial
    }

    /// A guest that loses the room channel tries to get it back.
    fn after_channel_lost(&mut self, peer: &PeerId) {
        let lost_room = !self.session.is_host() && self.session.room_id() == Some(peer);
        if lost_room && !self.done {
            tracing::warn!("Lost the channel to room {}", peer);
            self.session.signaling_lost();
            self.start_recovery();
        }
    }

    fn on_signaling(&mut self, state: SignalingState) {
        if state == SignalingState::Connected {
            return;
        }
        self.signaling = None;
        self.incoming = None;
        if self.recovery.is_none() {
            self.session.signaling_lost();
            self.start_recovery();
        }
    }

    fn start_recovery(&mut self) {
        if self.recovery.is_some() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let local = self.session.local_peer_id().clone();
        let room = self
            .session
            .room_id()
            .filter(|room| !self.session.is_host() && !self.session.connections().router().is_attached(room))
            .cloned();
        let inbox = self.inbox_tx.clone();
        let options = self.options.reconnect.clone();
        let cancel = self.cancel.clone();

        self.recovery = Some(tokio::spawn(async move {
            let mut reconnector = Reconnector::new(options, cancel);
            let result = reconnector
                .drive(
                    || reattach(Arc::clone(&transport), local.clone(), room.clone(), false),
                    |attempt| {
                        let _ = inbox.send(Internal::Reconnecting(attempt));
                        reattach(Arc::clone(&transport), local.clone(), room.clone(), true)
                    },
                )
                .await;
            let message = match result {
                Ok((registration, room)) => Internal::Recovered { registration, room },
                Err(err) => Internal::RecoveryFailed(err),
            };
            let _ = inbox.send(message);
        }));
    }

    fn flush_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::Progress(progress) => {
                    if let Some(observer) = &self.progress {
                        observer.on_transfer_progress(&progress);
                    }
                }
                SessionEvent::AssetReady(mut asset) => {
                    let renderer = Arc::clone(&self.renderer);
                    let inbox = self.inbox_tx.clone();
                    let bytes = std::mem::take(&mut asset.bytes);
                    tokio::spawn(async move {
                        let result = renderer.on_asset_reassembled(&asset.peer_id, asset.asset, bytes).await;
                        let _ = inbox.send(Internal::Loaded { asset, result });
                    });
                }
                SessionEvent::PeerLeft(peer) => {
                    if !self.session.is_host() && self.session.room_id() == Some(&peer) {
                        tracing::info!("Host closed room {}", peer);
                        self.session.fail();
                        self.done = true;
                    }
                }
                SessionEvent::PeerDisconnected(peer) => {
                    tracing::debug!("{} disconnected", peer);
                }
                SessionEvent::SceneChanged(scene) => {
                    tracing::debug!("Scene settings updated: {:?}", scene);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(recovery) = self.recovery.take() {
            recovery.abort();
        }
        for (_, pump) in self.pumps.drain() {
            pump.task.abort();
        }
        self.transport.unregister(self.session.local_peer_id());
        tracing::debug!("Session task for {} stopped", self.session.local_peer_id());
    }
}
