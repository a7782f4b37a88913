//! The `Session` aggregate: one explicitly owned object per session that
//! wires the connection manager, state sync, transfers and filtering
//! together.
//!
//! `Session` performs no I/O and reads no clock. Every input carries `now`
//! (unix ms) and every effect is either a send on an attached channel or a
//! [`SessionEvent`] queued for the caller. The async runtime drives it from
//! a single task, which gives the one-timeline ordering the state needs.

use std::collections::HashMap;
use std::sync::Arc;

use marionette_net::{
    Admission, AssetKind, AssetRequest, AvatarState, Bookkeeping, Chat, ChannelHandle,
    ConnectionManager, ConnectionOptions, Envelope, Message, PeerId, PeerJoined, Reaction,
    ReconnectOptions, Role, RoomId, SceneSettings, SessionStatus, StateError, SyncResponse, decode,
};

use crate::error::{RendererError, TransferError};
use crate::filter::{FilterOptions, RemoteStateFilter};
use crate::state_sync::{StateSyncEngine, SyncEffects, SyncOptions};
use crate::transfer::{
    Direction, ReassembledAsset, TransferEngine, TransferOptions, TransferOutput, TransferProgress,
    TransferStatus,
};

/// Every tunable of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    /// Timeouts, capacity, heartbeat.
    pub connection: ConnectionOptions,
    /// Signaling recovery.
    pub reconnect: ReconnectOptions,
    /// Broadcast cadence.
    pub sync: SyncOptions,
    /// Chunking and retries.
    pub transfer: TransferOptions,
    /// Remote smoothing.
    pub filter: FilterOptions,
}

impl From<&marionette_config::Config> for SessionOptions {
    fn from(config: &marionette_config::Config) -> Self {
        Self {
            connection: ConnectionOptions::from(config),
            reconnect: ReconnectOptions::from(&config.reconnect),
            sync: SyncOptions::from(&config.sync),
            transfer: TransferOptions::from(&config.transfer),
            filter: FilterOptions::from(&config.filter),
        }
    }
}

/// Something the embedding layer should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transfer progress, in order.
    Progress(TransferProgress),
    /// An asset finished reassembly and should be loaded.
    AssetReady(ReassembledAsset),
    /// A peer announced its departure.
    PeerLeft(PeerId),
    /// The direct channel to a peer went away.
    PeerDisconnected(PeerId),
    /// The host's scene settings arrived.
    SceneChanged(SceneSettings),
}

/// One participant's view of one session.
pub struct Session {
    options: SessionOptions,
    connections: ConnectionManager,
    sync: StateSyncEngine,
    transfers: TransferEngine,
    filter: RemoteStateFilter,
    local_assets: HashMap<AssetKind, Arc<[u8]>>,
    events: Vec<SessionEvent>,
}

impl Session {
    /// An idle session for `local`.
    pub fn new(local: PeerId, options: SessionOptions) -> Self {
        Self {
            connections: ConnectionManager::new(local.clone(), options.connection.clone()),
            sync: StateSyncEngine::new(local.clone(), options.sync.clone()),
            transfers: TransferEngine::new(local, options.transfer.clone()),
            filter: RemoteStateFilter::new(options.filter.clone()),
            local_assets: HashMap::new(),
            events: Vec::new(),
            options,
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start hosting. The room id is the local peer id.
    pub fn begin_host(&mut self, display_name: &str) -> Result<(), StateError> {
        let local = self.local_peer_id().clone();
        self.connections.begin(Role::Host, local, display_name)?;
        self.sync.set_display_name(display_name);
        Ok(())
    }

    /// Start joining `room`.
    pub fn begin_guest(&mut self, room: RoomId, display_name: &str) -> Result<(), StateError> {
        self.connections.begin(Role::Guest, room, display_name)?;
        self.sync.set_display_name(display_name);
        Ok(())
    }

    /// The session is established.
    pub fn mark_connected(&mut self) {
        self.connections.mark_connected();
    }

    /// Signaling registration was lost; channels are kept.
    pub fn signaling_lost(&mut self) {
        self.connections.signaling_lost();
    }

    /// Recovery attempt `attempt` is underway.
    pub fn reconnecting(&mut self, attempt: u32) {
        self.connections.reconnecting(attempt);
    }

    /// Announce departure, close every channel and drop all state.
    ///
    /// Returns how many peers were notified.
    pub fn leave(&mut self) -> usize {
        let notified = self.connections.leave();
        self.clear_state();
        tracing::info!("Left session ({} peers notified)", notified);
        notified
    }

    /// Terminal failure: tear down without announcing.
    pub fn fail(&mut self) {
        self.connections.fail();
        self.clear_state();
    }

    fn clear_state(&mut self) {
        self.transfers.cancel_all();
        self.filter.clear();
        self.sync.reset();
    }

    // -- channel events -----------------------------------------------------

    /// A channel to `peer` opened.
    ///
    /// A guest opening the room channel announces itself, asks for the full
    /// state and sends its own avatar.
    pub fn on_channel_open(&mut self, peer: PeerId, handle: ChannelHandle, now: u64) -> Admission {
        let admission = self.connections.on_channel_open(peer.clone(), handle, now);
        if admission == Admission::Rejected || self.is_host() || Some(&peer) != self.room_id() {
            return admission;
        }

        let announce = Message::PeerJoined(PeerJoined {
            peer_id: self.local_peer_id().clone(),
            display_name: self.connections.display_name().to_string(),
        });
        let router = self.connections.router();
        router.send(&peer, announce);
        router.send(&peer, Message::SyncRequest);
        if let Some(state) = self.sync.local_state_message() {
            router.send(&peer, state);
        }
        admission
    }

    /// Bytes arrived from `peer`.
    pub fn on_channel_data(&mut self, peer: &PeerId, bytes: &[u8], now: u64) {
        let envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::trace!("Dropping malformed message from {}: {}", peer, err);
                return;
            }
        };
        if let Message::Unknown { kind } = &envelope.message {
            tracing::trace!("Ignoring unknown message type '{}' from {}", kind, peer);
            return;
        }

        match self.connections.handle_bookkeeping(&envelope, now) {
            Bookkeeping::Consumed => return,
            Bookkeeping::Joined(joined) => {
                if let Message::PeerJoined(announce) = &envelope.message {
                    self.sync.note_peer(&joined, &announce.display_name);
                }
                self.connections.router().deliver(&envelope);
                return;
            }
            Bookkeeping::Left(left) => {
                self.forget_peer(&left);
                self.events.push(SessionEvent::PeerLeft(left));
                self.connections.router().deliver(&envelope);
                return;
            }
            Bookkeeping::Forward => {}
        }

        let router = self.connections.router();
        if self.connections.is_host() && envelope.sender == *peer && envelope.message.is_relayed() {
            router.broadcast_envelope(&envelope, Some(peer));
        }

        if let Some(target) = envelope.message.target() {
            if target != self.local_peer_id() {
                if self.connections.is_host() {
                    if !router.send_envelope(target, &envelope) {
                        tracing::debug!("Cannot forward {} to {}", envelope.message.kind(), target);
                    }
                } else {
                    tracing::trace!("Dropping {} addressed to {}", envelope.message.kind(), target);
                }
                return;
            }
        }

        self.dispatch(&envelope, now);
        self.connections.router().deliver(&envelope);
    }

    /// The channel to `peer` closed.
    pub fn on_channel_closed(&mut self, peer: &PeerId, now: u64) {
        let affected = self.affected_by_close(peer);
        self.connections.on_channel_closed(peer, now);
        self.after_close(affected);
    }

    /// The channel to `peer` failed.
    pub fn on_channel_error(&mut self, peer: &PeerId, reason: &str, now: u64) {
        let affected = self.affected_by_close(peer);
        self.connections.on_channel_error(peer, reason, now);
        self.after_close(affected);
    }

    /// Peers that become unreachable when the channel to `peer` goes away.
    fn affected_by_close(&self, peer: &PeerId) -> Vec<PeerId> {
        if !self.is_host() && Some(peer) == self.room_id() {
            let mut lost: Vec<PeerId> = self.connections.peers().map(|r| r.peer_id.clone()).collect();
            if !lost.contains(peer) {
                lost.push(peer.clone());
            }
            lost
        } else {
            vec![peer.clone()]
        }
    }

    fn after_close(&mut self, affected: Vec<PeerId>) {
        let retain = self.options.connection.retain_ghosts;
        for peer in affected {
            self.filter.reset(&peer);
            self.transfers.forget_peer(&peer);
            if retain {
                self.sync.peer_disconnected(&peer);
            } else {
                self.sync.forget_peer(&peer);
            }
            self.events.push(SessionEvent::PeerDisconnected(peer));
        }
    }

    fn forget_peer(&mut self, peer: &PeerId) {
        self.filter.reset(peer);
        self.transfers.forget_peer(peer);
        self.sync.forget_peer(peer);
    }

    // -- dispatch -----------------------------------------------------------

    fn dispatch(&mut self, envelope: &Envelope, now: u64) {
        let sender = &envelope.sender;
        match &envelope.message {
            Message::SyncRequest => {
                let response = self.sync.sync_response(self.is_host());
                self.send_toward(sender, response);
            }
            Message::AvatarState(_)
            | Message::PoseUpdate(_)
            | Message::ExpressionUpdate(_)
            | Message::SyncResponse(_) => {
                let effects = self.sync.apply(envelope);
                self.absorb_sync(effects, now);
            }
            Message::AssetRequest(request) => self.on_asset_request(sender, request.asset, now),
            Message::Chunk(chunk) => {
                let output = self.transfers.on_chunk(sender, chunk.clone());
                self.absorb_transfer(output);
            }
            Message::TransferComplete(complete) => {
                let output = self.transfers.on_transfer_complete(sender, complete, now);
                self.absorb_transfer(output);
            }
            Message::ChunkRequest(request) => {
                if let Some(resend) = self.transfers.on_chunk_request(sender, request) {
                    self.send_toward(&resend.to, resend.message);
                }
            }
            _ => {}
        }
    }

    fn absorb_sync(&mut self, effects: SyncEffects, now: u64) {
        for peer in &effects.updated {
            if let Some(state) = self.sync.avatars().get(peer) {
                self.connections.set_has_asset(peer, state.has_asset);
                self.filter.ingest(state, now);
            }
        }
        for (owner, asset) in effects.asset_requests {
            tracing::debug!("Requesting {:?} from {}", asset, owner);
            let request = Message::AssetRequest(AssetRequest {
                target: owner.clone(),
                asset,
            });
            if !self.send_toward(&owner, request) {
                self.sync.asset_failed(&owner, asset);
            }
        }
        if let Some(scene) = effects.scene {
            self.events.push(SessionEvent::SceneChanged(scene));
        }
    }

    fn on_asset_request(&mut self, requester: &PeerId, asset: AssetKind, now: u64) {
        let Some(source) = self.local_assets.get(&asset).cloned() else {
            tracing::warn!("{} requested {:?} but none is loaded", requester, asset);
            return;
        };
        match self.transfers.start_send(requester, asset, source, now) {
            Ok(progress) => self.events.push(SessionEvent::Progress(progress)),
            Err(err) => tracing::debug!("Ignoring asset request from {}: {}", requester, err),
        }
    }

    fn absorb_transfer(&mut self, output: TransferOutput) {
        for outgoing in output.outgoing {
            self.send_toward(&outgoing.to, outgoing.message);
        }
        for failed in output.failed {
            self.sync.asset_failed(&failed.peer_id, failed.asset);
        }
        for asset in &output.reassembled {
            self.sync.asset_received(&asset.peer_id, asset.asset);
        }
        self.events
            .extend(output.progress.into_iter().map(SessionEvent::Progress));
        self.events
            .extend(output.reassembled.into_iter().map(SessionEvent::AssetReady));
    }

    /// Send to `target` directly when a channel exists, otherwise through
    /// the room (the host forwards addressed messages).
    fn send_toward(&self, target: &PeerId, message: Message) -> bool {
        let router = self.connections.router();
        if router.is_attached(target) {
            return router.send(target, message);
        }
        match self.room_id() {
            Some(room) if !self.is_host() && router.is_attached(room) => router.send(room, message),
            _ => {
                tracing::debug!("No route to {} for {}", target, message.kind());
                false
            }
        }
    }

    // -- periodic work ------------------------------------------------------

    fn can_broadcast(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Connected | SessionStatus::SignalingLost | SessionStatus::Reconnecting { .. }
        )
    }

    /// Pose cadence. Returns whether a `pose-update` went out.
    pub fn pose_tick(&mut self, now: u64, sampled: Option<&AvatarState>) -> bool {
        if !self.can_broadcast() {
            return false;
        }
        let first = self.sync.avatars().local().is_none();
        let update = self.sync.pose_tick(now, sampled);
        self.broadcast_tick(update, first)
    }

    /// Expression cadence. Returns whether an `expression-update` went out.
    pub fn expression_tick(&mut self, now: u64, sampled: Option<&AvatarState>) -> bool {
        if !self.can_broadcast() {
            return false;
        }
        let first = self.sync.avatars().local().is_none();
        let update = self.sync.expression_tick(now, sampled);
        self.broadcast_tick(update, first)
    }

    /// The first sample is preceded by a full state so peers learn the
    /// display name and asset flag.
    fn broadcast_tick(&self, update: Option<Message>, first: bool) -> bool {
        let Some(update) = update else {
            return false;
        };
        let router = self.connections.router();
        if first {
            if let Some(state) = self.sync.local_state_message() {
                router.broadcast(state);
            }
        }
        router.broadcast(update);
        true
    }

    /// Ping every open channel.
    pub fn heartbeat(&mut self, now: u64) -> usize {
        self.connections.heartbeat(now)
    }

    /// Advance chunk pacing and retry rounds.
    pub fn transfer_tick(&mut self, now: u64) {
        let output = self.transfers.tick(now);
        self.absorb_transfer(output);
    }

    /// Smoothed states of every remote avatar for a frame at `now`.
    pub fn remote_states(&mut self, now: u64) -> Vec<AvatarState> {
        self.filter.render_all(now)
    }

    // -- assets -------------------------------------------------------------

    /// Make an asset available to peers (or withdraw it with `None`).
    ///
    /// An avatar is announced with a fresh `avatar-state`; a host background
    /// with updated scene settings.
    pub fn set_local_asset(&mut self, asset: AssetKind, bytes: Option<Arc<[u8]>>, now: u64) {
        let available = bytes.is_some();
        match bytes {
            Some(bytes) => self.local_assets.insert(asset, bytes),
            None => self.local_assets.remove(&asset),
        };
        self.sync.set_local_asset(asset, available, now);
        if !self.can_broadcast() {
            return;
        }
        let router = self.connections.router();
        match asset {
            AssetKind::Avatar => {
                if let Some(state) = self.sync.local_state_message() {
                    router.broadcast(state);
                }
            }
            AssetKind::Background if self.is_host() => {
                router.broadcast(Message::SyncResponse(SyncResponse {
                    avatar_states: Vec::new(),
                    scene_settings: Some(self.sync.scene().clone()),
                }));
            }
            AssetKind::Background => {}
        }
    }

    /// Push `bytes` to `peer` unrequested.
    pub fn send_asset(
        &mut self,
        peer: &PeerId,
        asset: AssetKind,
        bytes: Arc<[u8]>,
        now: u64,
    ) -> Result<TransferProgress, TransferError> {
        let progress = self.transfers.start_send(peer, asset, bytes, now)?;
        self.events.push(SessionEvent::Progress(progress.clone()));
        Ok(progress)
    }

    /// The loader finished with a reassembled asset.
    pub fn asset_loaded(&mut self, asset: &ReassembledAsset, result: Result<(), RendererError>) {
        let status = match result {
            Ok(()) => TransferStatus::Complete,
            Err(err) => {
                tracing::warn!("Loading {:?} from {} failed: {}", asset.asset, asset.peer_id, err);
                TransferStatus::Error
            }
        };
        self.events.push(SessionEvent::Progress(TransferProgress {
            peer_id: asset.peer_id.clone(),
            asset: asset.asset,
            direction: Direction::Receive,
            chunks_complete: asset.total_chunks,
            total_chunks: asset.total_chunks,
            status,
        }));
    }

    // -- social -------------------------------------------------------------

    /// Broadcast a chat line.
    pub fn send_chat(&self, text: &str) -> usize {
        self.connections.router().broadcast(Message::Chat(Chat {
            text: text.to_string(),
        }))
    }

    /// Broadcast a reaction.
    pub fn send_reaction(&self, emoji: &str) -> usize {
        self.connections.router().broadcast(Message::Reaction(Reaction {
            emoji: emoji.to_string(),
        }))
    }

    // -- accessors ----------------------------------------------------------

    /// Take the queued events.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.connections.status()
    }

    /// Whether we host.
    pub fn is_host(&self) -> bool {
        self.connections.is_host()
    }

    /// Local peer id.
    pub fn local_peer_id(&self) -> &PeerId {
        self.connections.local_peer_id()
    }

    /// Room of the active session.
    pub fn room_id(&self) -> Option<&RoomId> {
        self.connections.session().map(|s| &s.room_id)
    }

    /// The connection manager.
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// The connection manager, mutably.
    pub fn connections_mut(&mut self) -> &mut ConnectionManager {
        &mut self.connections
    }

    /// The state sync engine.
    pub fn sync(&self) -> &StateSyncEngine {
        &self.sync
    }

    /// The transfer engine.
    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    /// The remote state filter.
    pub fn filter(&self) -> &RemoteStateFilter {
        &self.filter
    }

    /// Options in use.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use marionette_net::{Channel, ChannelEvent, MessageTag};

    use super::*;

    fn options() -> SessionOptions {
        SessionOptions {
            transfer: TransferOptions {
                chunk_size: 4,
                chunk_delay: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn host() -> Session {
        let mut session = Session::new(PeerId::from("host"), options());
        session.begin_host("Host").unwrap();
        session.mark_connected();
        session
    }

    fn guest(id: &str) -> Session {
        let mut session = Session::new(PeerId::from(id), options());
        session.begin_guest(PeerId::from("host"), &id.to_uppercase()).unwrap();
        session
    }

    /// Open a channel guest → host. Returns (host end, guest end).
    fn link(host: &mut Session, guest: &mut Session) -> (Channel, Channel) {
        let (host_end, guest_end) =
            Channel::pair(host.local_peer_id().clone(), guest.local_peer_id().clone());
        assert_eq!(
            host.on_channel_open(host_end.remote.clone(), host_end.handle.clone(), 0),
            Admission::Accepted
        );
        guest.on_channel_open(guest_end.remote.clone(), guest_end.handle.clone(), 0);
        guest.mark_connected();
        (host_end, guest_end)
    }

    /// Feed everything queued on `end` into `session`. Returns the kinds seen.
    fn pump(session: &mut Session, end: &mut Channel, now: u64) -> Vec<MessageTag> {
        let mut seen = Vec::new();
        while let Ok(event) = end.events.try_recv() {
            match event {
                ChannelEvent::Data(bytes) => {
                    if let Ok(envelope) = decode(&bytes) {
                        seen.push(envelope.message.tag());
                    }
                    session.on_channel_data(&end.remote, &bytes, now);
                }
                ChannelEvent::Closed => session.on_channel_closed(&end.remote, now),
                ChannelEvent::Error(reason) => session.on_channel_error(&end.remote, &reason, now),
            }
        }
        seen
    }

    fn sampled(x: f32) -> AvatarState {
        AvatarState {
            position: glam::Vec3::new(x, 0.0, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_guest_join_syncs_and_requests_asset_once() {
        let mut host = host();
        let source: Arc<[u8]> = Arc::from((0u8..10).collect::<Vec<u8>>());
        assert!(host.pose_tick(1, Some(&sampled(0.0))));
        host.set_local_asset(AssetKind::Avatar, Some(source.clone()), 5);
        let mut guest = guest("g1");
        let (mut at_host, mut at_guest) = link(&mut host, &mut guest);

        // nothing sampled on the guest yet, so no avatar-state
        let seen = pump(&mut host, &mut at_host, 10);
        assert_eq!(seen, vec![MessageTag::PeerJoined, MessageTag::SyncRequest]);
        pump(&mut guest, &mut at_guest, 20);

        let host_id = PeerId::from("host");
        let record = guest.connections().peer(&host_id).unwrap();
        assert!(record.has_asset);
        assert_eq!(record.display_name, "Host");
        assert!(guest.sync().is_pending(&host_id, AssetKind::Avatar));

        // a second full sync must not re-request
        guest.connections().router().send(&host_id, Message::SyncRequest);
        let seen = pump(&mut host, &mut at_host, 30);
        let requests = seen.iter().filter(|t| **t == MessageTag::AssetRequest).count();
        assert_eq!(requests, 1);
        pump(&mut guest, &mut at_guest, 40);
        let seen = pump(&mut host, &mut at_host, 50);
        assert!(!seen.contains(&MessageTag::AssetRequest));

        for now in 60..70 {
            host.transfer_tick(now);
        }
        pump(&mut guest, &mut at_guest, 80);
        let ready: Vec<ReassembledAsset> = guest
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::AssetReady(asset) => Some(asset),
                _ => None,
            })
            .collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bytes, source.to_vec());
        assert!(!guest.sync().is_pending(&host_id, AssetKind::Avatar));
    }

    #[test]
    fn test_host_relays_guest_state_and_chat() {
        let mut host = host();
        let mut a = guest("a");
        let mut b = guest("b");
        let (mut host_a, mut a_end) = link(&mut host, &mut a);
        let (mut host_b, mut b_end) = link(&mut host, &mut b);
        pump(&mut host, &mut host_a, 0);
        pump(&mut host, &mut host_b, 0);
        pump(&mut a, &mut a_end, 0);
        pump(&mut b, &mut b_end, 0);

        let chats = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chats);
        let _sub = b.connections().router().on_tag(MessageTag::Chat, move |envelope| {
            sink.lock().unwrap().push(envelope.sender.clone());
        });

        assert!(a.pose_tick(100, Some(&sampled(3.0))));
        a.send_chat("hello");
        pump(&mut host, &mut host_a, 110);
        let seen = pump(&mut b, &mut b_end, 120);
        assert!(seen.contains(&MessageTag::PoseUpdate));

        let a_id = PeerId::from("a");
        let state = b.sync().avatars().get(&a_id).unwrap();
        assert_eq!(state.position.x, 3.0);
        assert!(b.filter().contains(&a_id));
        assert!(b.connections().peer(&a_id).is_some());
        assert_eq!(chats.lock().unwrap().as_slice(), &[a_id.clone()]);
        assert!(host.sync().avatars().get(&a_id).is_some());
    }

    #[test]
    fn test_first_sample_announces_full_state() {
        let mut host = host();
        let mut a = guest("a");
        let (mut host_a, mut a_end) = link(&mut host, &mut a);
        pump(&mut host, &mut host_a, 0);
        pump(&mut a, &mut a_end, 0);
        a.set_local_asset(AssetKind::Avatar, Some(Arc::from(vec![1u8; 6])), 5);
        assert!(pump(&mut host, &mut host_a, 6).is_empty());

        assert!(a.pose_tick(10, Some(&sampled(1.0))));
        let seen = pump(&mut host, &mut host_a, 20);
        assert_eq!(seen, vec![MessageTag::AvatarState, MessageTag::PoseUpdate]);
        let a_id = PeerId::from("a");
        assert_eq!(host.sync().avatars().get(&a_id).unwrap().display_name, "A");
        assert!(host.connections().peer(&a_id).unwrap().has_asset);

        assert!(a.pose_tick(100, Some(&sampled(2.0))));
        let seen = pump(&mut host, &mut host_a, 110);
        assert_eq!(seen, vec![MessageTag::PoseUpdate]);
    }

    #[test]
    fn test_closed_guest_becomes_ghost() {
        let mut host = host();
        let mut a = guest("a");
        let (mut host_a, a_end) = link(&mut host, &mut a);
        pump(&mut host, &mut host_a, 0);
        a.pose_tick(10, Some(&sampled(1.0)));
        pump(&mut host, &mut host_a, 20);
        let a_id = PeerId::from("a");
        assert!(host.filter().contains(&a_id));

        drop(a_end);
        host.on_channel_closed(&a_id, 30);
        assert!(!host.filter().contains(&a_id));
        assert!(host.sync().avatars().get(&a_id).is_some());
        assert!(!host.connections().peer(&a_id).unwrap().is_live());
        assert!(host.drain_events().contains(&SessionEvent::PeerDisconnected(a_id)));
    }

    #[test]
    fn test_leave_announces_and_clears() {
        let mut host = host();
        let mut a = guest("a");
        let (mut host_a, mut a_end) = link(&mut host, &mut a);
        pump(&mut host, &mut host_a, 0);
        pump(&mut a, &mut a_end, 0);
        a.pose_tick(10, Some(&sampled(1.0)));
        pump(&mut host, &mut host_a, 20);

        assert_eq!(a.leave(), 1);
        assert_eq!(a.status(), SessionStatus::Idle);
        assert!(a.sync().avatars().remote().next().is_none());

        pump(&mut host, &mut host_a, 30);
        let a_id = PeerId::from("a");
        assert!(host.connections().peer(&a_id).is_none());
        assert!(host.sync().avatars().get(&a_id).is_none());
        assert!(host.drain_events().contains(&SessionEvent::PeerLeft(a_id)));
    }

    #[test]
    fn test_self_addressed_state_is_ignored() {
        let mut host = host();
        let mut a = guest("a");
        let (mut host_a, mut a_end) = link(&mut host, &mut a);
        pump(&mut host, &mut host_a, 0);
        pump(&mut a, &mut a_end, 0);
        a.pose_tick(10, Some(&sampled(1.0)));
        let before = a.sync().avatars().local().cloned();

        // the host echoes a state that claims to be a's
        let echo = Envelope::new(
            PeerId::from("a"),
            u64::MAX,
            Message::AvatarState(Box::new(AvatarState {
                peer_id: PeerId::from("a"),
                position: glam::Vec3::splat(99.0),
                timestamp_ms: u64::MAX,
                ..Default::default()
            })),
        );
        host.connections().router().send_envelope(&PeerId::from("a"), &echo);
        pump(&mut a, &mut a_end, 20);
        assert_eq!(a.sync().avatars().local().cloned(), before);
    }

    #[test]
    fn test_malformed_and_unknown_input_dropped() {
        let mut host = host();
        host.on_channel_data(&PeerId::from("x"), &[], 0);
        host.on_channel_data(&PeerId::from("x"), &[1, 2, 3, 4], 0);
        assert!(host.drain_events().is_empty());
        assert_eq!(host.status(), SessionStatus::Connected);
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let mut host = host();
        assert!(matches!(
            host.begin_host("again"),
            Err(StateError::AlreadyActive(SessionStatus::Connected))
        ));
    }
}
