//! Session lifecycle, peer bookkeeping, host admission and heartbeat.
//!
//! The [`ConnectionManager`] owns the [`MessageRouter`] and the peer table
//! of one session. It is a plain state machine: the session runtime feeds it
//! channel open/close events and decoded envelopes in order, and it answers
//! with the sends that bookkeeping requires (relays, pongs, announcements).
//! The session status is published through a [`StatusWatch`] so any number
//! of consumers can react without polling.
//!
//! Topology is a star. Guests connect only to the host; the host relays
//! `peer-joined`/`peer-left` so every participant learns about every other.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::watch;

use crate::diagnostics::{DEFAULT_WINDOW, LatencySnapshot, LatencyTracker};
use crate::messages::{Envelope, Message, PeerJoined, PeerLeft, Ping, Pong};
use crate::peer::{PeerId, RoomId};
use crate::routing::{ConnectionChange, MessageRouter};
use crate::transport::ChannelHandle;

/// Which side of the star this participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rendezvous point; owns the room id.
    Host,
    /// Connected to the host only.
    Guest,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session.
    Idle,
    /// Creating or joining; bounded by the connect timeout.
    Connecting,
    /// Session established.
    Connected,
    /// Signaling registration lost; recovery about to start.
    SignalingLost,
    /// Recovering; `attempt` is 0 during the in-place resume.
    Reconnecting {
        /// Full attempt number, 0 while resuming.
        attempt: u32,
    },
    /// Terminal. The caller must create or join again.
    Failed,
}

/// Observable session status backed by a [`watch`] channel.
pub struct StatusWatch {
    tx: watch::Sender<SessionStatus>,
    rx: watch::Receiver<SessionStatus>,
}

impl Default for StatusWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusWatch {
    /// Create a new watch initialized to [`SessionStatus::Idle`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(SessionStatus::Idle);
        Self { tx, rx }
    }

    /// Set the current status, notifying all subscribers.
    pub fn set(&self, status: SessionStatus) {
        let _ = self.tx.send(status);
    }

    /// Return a new subscriber receiver. The current status counts as seen.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Return the current status without blocking.
    pub fn current(&self) -> SessionStatus {
        *self.rx.borrow()
    }
}

/// Connection state of one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Announced but not yet confirmed.
    Connecting,
    /// Reachable, directly or through the host.
    Connected,
    /// Channel closed; the record is a ghost.
    Disconnected,
    /// Channel failed; the record is a ghost.
    Error,
}

/// What this participant knows about one remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    /// Remote peer id.
    pub peer_id: PeerId,
    /// Announced display name (empty until announced).
    pub display_name: String,
    /// Current connection state.
    pub connection_state: PeerConnectionState,
    /// Whether the peer reported an avatar asset.
    pub has_asset: bool,
    /// Last heartbeat latency, direct peers only.
    pub latency_ms: Option<u64>,
    /// Wall-clock ms of the last message from or about this peer.
    pub last_activity_at: u64,
    /// Whether a channel to this peer exists (false for relayed peers).
    pub direct: bool,
}

impl PeerRecord {
    fn new(peer_id: PeerId, now: u64) -> Self {
        Self {
            peer_id,
            display_name: String::new(),
            connection_state: PeerConnectionState::Connecting,
            has_asset: false,
            latency_ms: None,
            last_activity_at: now,
            direct: false,
        }
    }

    /// Whether the peer is currently reachable.
    pub fn is_live(&self) -> bool {
        matches!(
            self.connection_state,
            PeerConnectionState::Connecting | PeerConnectionState::Connected
        )
    }
}

/// Immutable identity of an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Room id; equal to the host's peer id.
    pub room_id: RoomId,
    /// Local role.
    pub role: Role,
    /// Local peer id.
    pub local_peer_id: PeerId,
    /// Local display name.
    pub display_name: String,
}

/// Runtime options for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Create/join must reach `Connected` within this time.
    pub connect_timeout: Duration,
    /// Maximum participants a host admits, itself included.
    pub max_peers: usize,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Keep closed peers as ghosts instead of deleting them.
    pub retain_ghosts: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_peers: 8,
            heartbeat_interval: Duration::from_secs(5),
            retain_ghosts: true,
        }
    }
}

impl From<&marionette_config::Config> for ConnectionOptions {
    fn from(config: &marionette_config::Config) -> Self {
        let session = &config.session;
        Self {
            connect_timeout: Duration::from_millis(session.connect_timeout_ms),
            max_peers: session.max_peers.max(1),
            heartbeat_interval: Duration::from_millis(session.heartbeat_interval_ms.max(1)),
            retain_ghosts: session.retain_ghosts,
        }
    }
}

/// Errors from lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A session is already being created, joined or running.
    #[error("a session is already active ({0:?})")]
    AlreadyActive(SessionStatus),
}

/// Host decision on an incoming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Channel registered.
    Accepted,
    /// Room full; channel closed.
    Rejected,
}

/// Result of running session bookkeeping on an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bookkeeping {
    /// Handled entirely here (heartbeat, own echo).
    Consumed,
    /// A peer was announced or re-announced.
    Joined(PeerId),
    /// A peer announced its departure; its record is gone.
    Left(PeerId),
    /// Not a bookkeeping message.
    Forward,
}

/// Owns the session identity, peer table, router and heartbeat state.
pub struct ConnectionManager {
    options: ConnectionOptions,
    status: StatusWatch,
    session: Option<SessionInfo>,
    peers: BTreeMap<PeerId, PeerRecord>,
    latency: HashMap<PeerId, LatencyTracker>,
    router: MessageRouter,
}

impl ConnectionManager {
    /// Create an idle manager for `local`.
    pub fn new(local: PeerId, options: ConnectionOptions) -> Self {
        Self {
            options,
            status: StatusWatch::new(),
            session: None,
            peers: BTreeMap::new(),
            latency: HashMap::new(),
            router: MessageRouter::new(local),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Enter `Connecting` for a new session.
    ///
    /// A host's room id is its own peer id.
    pub fn begin(
        &mut self,
        role: Role,
        room_id: RoomId,
        display_name: impl Into<String>,
    ) -> Result<(), StateError> {
        match self.status.current() {
            SessionStatus::Idle | SessionStatus::Failed => {}
            other => return Err(StateError::AlreadyActive(other)),
        }
        let local = self.router.local().clone();
        let room_id = match role {
            Role::Host => local.clone(),
            Role::Guest => room_id,
        };
        self.session = Some(SessionInfo {
            room_id,
            role,
            local_peer_id: local,
            display_name: display_name.into(),
        });
        self.status.set(SessionStatus::Connecting);
        Ok(())
    }

    /// `Connecting`/`Reconnecting` → `Connected`.
    pub fn mark_connected(&mut self) {
        tracing::info!(
            "Session {} connected",
            self.session
                .as_ref()
                .map(|s| s.room_id.to_string())
                .unwrap_or_default()
        );
        self.status.set(SessionStatus::Connected);
    }

    /// Signaling registration was lost.
    pub fn signaling_lost(&mut self) {
        tracing::warn!("Signaling lost; existing channels kept while recovering");
        self.status.set(SessionStatus::SignalingLost);
    }

    /// Recovery in progress.
    pub fn reconnecting(&mut self, attempt: u32) {
        self.status.set(SessionStatus::Reconnecting { attempt });
    }

    /// Tear everything down and enter the terminal `Failed` state.
    pub fn fail(&mut self) {
        self.teardown();
        self.status.set(SessionStatus::Failed);
    }

    /// Best-effort `peer-left` to everyone, then tear down and go `Idle`.
    ///
    /// Returns how many peers were notified.
    pub fn leave(&mut self) -> usize {
        let local = self.router.local().clone();
        let notified = self
            .router
            .broadcast(Message::PeerLeft(PeerLeft { peer_id: local }));
        self.teardown();
        self.status.set(SessionStatus::Idle);
        notified
    }

    fn teardown(&mut self) {
        self.router.close_all();
        self.peers.clear();
        self.latency.clear();
        self.session = None;
    }

    // -- channels -----------------------------------------------------------

    /// A channel to `peer` opened. Hosts enforce the participant cap.
    pub fn on_channel_open(&mut self, peer: PeerId, handle: ChannelHandle, now: u64) -> Admission {
        if self.is_host() && self.live_channel_count() + 1 >= self.options.max_peers {
            tracing::warn!(
                "Room full ({} participants); rejecting {}",
                self.options.max_peers,
                peer
            );
            handle.close();
            return Admission::Rejected;
        }

        self.router.attach(peer.clone(), handle);
        let record = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerRecord::new(peer.clone(), now));
        record.connection_state = PeerConnectionState::Connected;
        record.direct = true;
        record.last_activity_at = now;
        self.latency.insert(
            peer.clone(),
            LatencyTracker::new(DEFAULT_WINDOW, self.ping_timeout_ms()),
        );

        tracing::info!("Channel to {} opened", peer);
        self.router.notify(&peer, ConnectionChange::Opened);
        Admission::Accepted
    }

    /// The channel to `peer` closed.
    ///
    /// Hosts announce the departure to the remaining guests. Returns whether
    /// the peer was still known.
    pub fn on_channel_closed(&mut self, peer: &PeerId, now: u64) -> bool {
        self.close_peer(peer, PeerConnectionState::Disconnected, now)
    }

    /// The channel to `peer` failed. Same as a close, but the ghost is
    /// marked [`PeerConnectionState::Error`].
    pub fn on_channel_error(&mut self, peer: &PeerId, reason: &str, now: u64) -> bool {
        tracing::warn!("Channel to {} failed: {}", peer, reason);
        self.close_peer(peer, PeerConnectionState::Error, now)
    }

    fn close_peer(&mut self, peer: &PeerId, ghost_state: PeerConnectionState, now: u64) -> bool {
        if let Some(handle) = self.router.detach(peer) {
            handle.close();
        }
        self.latency.remove(peer);

        let known = self.peers.contains_key(peer);
        if known && self.is_host() {
            let left = Message::PeerLeft(PeerLeft {
                peer_id: peer.clone(),
            });
            self.router.broadcast_except(peer, left);
        }

        // A guest that loses the host loses everyone behind it.
        let lost: Vec<PeerId> = if self.role() == Some(Role::Guest) && self.is_room(peer) {
            self.peers.keys().cloned().collect()
        } else if known {
            vec![peer.clone()]
        } else {
            Vec::new()
        };

        for id in lost {
            if self.options.retain_ghosts {
                if let Some(record) = self.peers.get_mut(&id) {
                    record.connection_state = ghost_state;
                    record.direct = false;
                    record.latency_ms = None;
                    record.last_activity_at = now;
                }
            } else {
                self.peers.remove(&id);
            }
        }

        tracing::info!("Channel to {} closed", peer);
        self.router.notify(peer, ConnectionChange::Closed);
        known
    }

    // -- bookkeeping --------------------------------------------------------

    /// React to session-bookkeeping messages before they reach subscribers.
    pub fn handle_bookkeeping(&mut self, envelope: &Envelope, now: u64) -> Bookkeeping {
        if let Some(record) = self.peers.get_mut(&envelope.sender) {
            record.last_activity_at = now;
        }

        match &envelope.message {
            Message::PeerJoined(joined) => self.on_peer_joined(envelope, joined, now),
            Message::PeerLeft(left) => self.on_peer_left(envelope, left),
            Message::Ping(ping) => {
                let pong = Message::Pong(Pong {
                    sent_at: ping.sent_at,
                    received_at: now,
                });
                if !self.router.send(&envelope.sender, pong) {
                    tracing::debug!("Pong to {} not delivered", envelope.sender);
                }
                Bookkeeping::Consumed
            }
            Message::Pong(pong) => {
                if let Some(tracker) = self.latency.get_mut(&envelope.sender) {
                    let latency = tracker.on_pong(pong.sent_at, now);
                    if let Some(record) = self.peers.get_mut(&envelope.sender) {
                        record.latency_ms = Some(latency);
                    }
                }
                Bookkeeping::Consumed
            }
            _ => Bookkeeping::Forward,
        }
    }

    fn on_peer_joined(&mut self, envelope: &Envelope, joined: &PeerJoined, now: u64) -> Bookkeeping {
        if &joined.peer_id == self.router.local() {
            return Bookkeeping::Consumed;
        }

        let direct = self.router.is_attached(&joined.peer_id);
        let record = self
            .peers
            .entry(joined.peer_id.clone())
            .or_insert_with(|| PeerRecord::new(joined.peer_id.clone(), now));
        record.display_name = joined.display_name.clone();
        record.connection_state = PeerConnectionState::Connected;
        record.direct = direct;
        record.last_activity_at = now;

        tracing::info!("{} ({}) joined", joined.display_name, joined.peer_id);
        self.router.notify(
            &joined.peer_id,
            ConnectionChange::Joined {
                display_name: joined.display_name.clone(),
            },
        );

        if self.is_host() && envelope.sender == joined.peer_id {
            self.router.broadcast_envelope(envelope, Some(&joined.peer_id));
            self.introduce_existing_peers(&joined.peer_id);
        }

        Bookkeeping::Joined(joined.peer_id.clone())
    }

    /// Send `newcomer` a `peer-joined` for the host and every other live peer.
    fn introduce_existing_peers(&self, newcomer: &PeerId) {
        let Some(session) = &self.session else {
            return;
        };
        let mut introductions = vec![PeerJoined {
            peer_id: session.local_peer_id.clone(),
            display_name: session.display_name.clone(),
        }];
        introductions.extend(
            self.peers
                .values()
                .filter(|record| &record.peer_id != newcomer && record.is_live())
                .map(|record| PeerJoined {
                    peer_id: record.peer_id.clone(),
                    display_name: record.display_name.clone(),
                }),
        );
        for joined in introductions {
            self.router.send(newcomer, Message::PeerJoined(joined));
        }
    }

    fn on_peer_left(&mut self, envelope: &Envelope, left: &PeerLeft) -> Bookkeeping {
        if &left.peer_id == self.router.local() {
            return Bookkeeping::Consumed;
        }

        let was_known = self.peers.remove(&left.peer_id).is_some();
        self.latency.remove(&left.peer_id);

        if self.is_host() && envelope.sender == left.peer_id && was_known {
            self.router.broadcast_envelope(envelope, Some(&left.peer_id));
        }

        tracing::info!("{} left", left.peer_id);
        self.router.notify(&left.peer_id, ConnectionChange::Left);
        Bookkeeping::Left(left.peer_id.clone())
    }

    // -- heartbeat ----------------------------------------------------------

    /// Ping every open channel. Returns how many pings went out.
    ///
    /// Undelivered pings are not a disconnect signal; only channel closure is.
    pub fn heartbeat(&mut self, now: u64) -> usize {
        let mut sent = 0;
        for peer in self.router.connected_peers() {
            if self.router.send(&peer, Message::Ping(Ping { sent_at: now })) {
                let timeout = self.ping_timeout_ms();
                let tracker = self
                    .latency
                    .entry(peer)
                    .or_insert_with(|| LatencyTracker::new(DEFAULT_WINDOW, timeout));
                tracker.on_ping_sent(now);
                tracker.expire_pending(now);
                sent += 1;
            } else {
                tracing::debug!("Heartbeat to {} not delivered", peer);
            }
        }
        sent
    }

    fn ping_timeout_ms(&self) -> u64 {
        (self.options.heartbeat_interval.as_millis() as u64).saturating_mul(2)
    }

    // -- accessors ----------------------------------------------------------

    /// Current session status.
    pub fn status(&self) -> SessionStatus {
        self.status.current()
    }

    /// Status watch for subscribers.
    pub fn status_watch(&self) -> &StatusWatch {
        &self.status
    }

    /// Active session identity.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// Local role, if a session is active.
    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    /// Whether the local participant hosts the active session.
    pub fn is_host(&self) -> bool {
        self.role() == Some(Role::Host)
    }

    fn is_room(&self, peer: &PeerId) -> bool {
        self.session.as_ref().is_some_and(|s| &s.room_id == peer)
    }

    /// Local peer id.
    pub fn local_peer_id(&self) -> &PeerId {
        self.router.local()
    }

    /// Local display name (empty without a session).
    pub fn display_name(&self) -> &str {
        self.session
            .as_ref()
            .map(|s| s.display_name.as_str())
            .unwrap_or_default()
    }

    /// Known peers, sorted by id. Ghosts included.
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Look up one peer.
    pub fn peer(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    /// Record whether `peer` reported an avatar asset.
    pub fn set_has_asset(&mut self, peer: &PeerId, has_asset: bool) {
        if let Some(record) = self.peers.get_mut(peer) {
            record.has_asset = has_asset;
        }
    }

    /// Latency statistics for a direct peer.
    pub fn latency(&self, peer: &PeerId) -> Option<LatencySnapshot> {
        self.latency.get(peer).map(LatencyTracker::snapshot)
    }

    /// Number of open channels.
    pub fn live_channel_count(&self) -> usize {
        self.router.connected_peers().len()
    }

    /// The router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// The router, mutably.
    pub fn router_mut(&mut self) -> &mut MessageRouter {
        &mut self.router
    }

    /// Options in use.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
