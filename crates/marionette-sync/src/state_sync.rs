//! State Sync Engine: rate-limited pose/expression broadcast, full-state
//! reconciliation, and application of inbound state.
//!
//! The engine is sans-IO. Tick methods return the message to broadcast (if
//! any); [`StateSyncEngine::apply`] returns the peers whose state changed
//! and the asset requests that should go out.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use marionette_net::{
    AssetKind, AvatarState, Envelope, ExpressionUpdate, Message, PeerId, PoseUpdate,
    SceneSettings, SyncResponse,
};

use crate::avatar::{ApplyOutcome, AvatarStore};

/// Outbound broadcast settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Minimum spacing of pose broadcasts.
    pub pose_interval: Duration,
    /// Minimum spacing of expression broadcasts.
    pub expression_interval: Duration,
    /// Per-channel change that counts as an expression change.
    pub expression_threshold: f32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            pose_interval: rate_to_interval(30),
            expression_interval: rate_to_interval(10),
            expression_threshold: 0.01,
        }
    }
}

impl From<&marionette_config::SyncConfig> for SyncOptions {
    fn from(config: &marionette_config::SyncConfig) -> Self {
        Self {
            pose_interval: rate_to_interval(config.pose_rate_hz),
            expression_interval: rate_to_interval(config.expression_rate_hz),
            expression_threshold: config.expression_threshold.max(0.0),
        }
    }
}

/// Period of a rate in Hz (a zero rate is treated as 1 Hz).
pub fn rate_to_interval(rate_hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)))
}

/// Lets an action through at most once per interval.
///
/// Calls up to 10% early still pass so a timer that fires slightly ahead of
/// schedule does not skip a whole period.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval_ms: u64,
    last: Option<u64>,
}

impl RateLimiter {
    /// Limiter for the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last: None,
        }
    }

    /// Whether the action may run at `now` (ms). Records the run if so.
    pub fn ready(&mut self, now: u64) -> bool {
        let slack = self.interval_ms / 10;
        match self.last {
            Some(last) if now.saturating_sub(last) + slack < self.interval_ms => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Forget the last run.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// What [`StateSyncEngine::apply`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncEffects {
    /// Peers whose stored state changed, in application order.
    pub updated: Vec<PeerId>,
    /// Assets to request: `(owner, asset)`. Each pair is issued once.
    pub asset_requests: Vec<(PeerId, AssetKind)>,
    /// Scene settings received from the host.
    pub scene: Option<SceneSettings>,
}

/// Outbound cadence plus the per-peer avatar model.
#[derive(Debug, Clone)]
pub struct StateSyncEngine {
    options: SyncOptions,
    pose_limiter: RateLimiter,
    expression_limiter: RateLimiter,
    last_expressions: Option<BTreeMap<String, f32>>,
    avatars: AvatarStore,
    display_name: String,
    has_avatar: bool,
    scene: SceneSettings,
    received_assets: HashSet<(PeerId, AssetKind)>,
    pending_requests: HashSet<(PeerId, AssetKind)>,
}

impl StateSyncEngine {
    /// Engine for `local`.
    pub fn new(local: PeerId, options: SyncOptions) -> Self {
        Self {
            pose_limiter: RateLimiter::new(options.pose_interval),
            expression_limiter: RateLimiter::new(options.expression_interval),
            options,
            last_expressions: None,
            avatars: AvatarStore::new(local),
            display_name: String::new(),
            has_avatar: false,
            scene: SceneSettings::default(),
            received_assets: HashSet::new(),
            pending_requests: HashSet::new(),
        }
    }

    // -- outbound -----------------------------------------------------------

    /// Record the freshly sampled local state, keeping session-owned fields.
    fn store_local(&mut self, sampled: &AvatarState, now: u64) {
        let mut state = sampled.clone();
        state.display_name = self.display_name.clone();
        state.has_asset = self.has_avatar;
        state.timestamp_ms = now;
        self.avatars.set_local(state);
    }

    /// Pose cadence. Returns the `pose-update` to broadcast, or `None` when
    /// rate-limited or nothing was sampled.
    pub fn pose_tick(&mut self, now: u64, sampled: Option<&AvatarState>) -> Option<Message> {
        let sampled = sampled?;
        if !self.pose_limiter.ready(now) {
            return None;
        }
        self.store_local(sampled, now);
        Some(Message::PoseUpdate(PoseUpdate {
            pose: sampled.pose.clone(),
            root_rotation: Some(sampled.root_rotation),
            position: Some(sampled.position),
        }))
    }

    /// Expression cadence. Broadcasts only when some weight moved more than
    /// the threshold since the last broadcast (or a channel appeared or
    /// disappeared).
    pub fn expression_tick(&mut self, now: u64, sampled: Option<&AvatarState>) -> Option<Message> {
        let sampled = sampled?;
        if !self.expression_limiter.ready(now) {
            return None;
        }
        let current = &sampled.expressions;
        let changed = match &self.last_expressions {
            None => true,
            Some(last) => {
                last.len() != current.len()
                    || current.iter().any(|(name, weight)| match last.get(name) {
                        Some(previous) => (weight - previous).abs() > self.options.expression_threshold,
                        None => true,
                    })
            }
        };
        if !changed {
            return None;
        }
        self.last_expressions = Some(current.clone());
        match self.avatars.local_mut() {
            Some(local) => local.expressions = current.clone(),
            None => self.store_local(sampled, now),
        }
        Some(Message::ExpressionUpdate(ExpressionUpdate {
            expressions: current.clone(),
        }))
    }

    /// Full local state as an `avatar-state` message, once one was sampled.
    pub fn local_state_message(&self) -> Option<Message> {
        self.avatars
            .local()
            .map(|state| Message::AvatarState(Box::new(state.clone())))
    }

    /// Answer to a `sync-request`: every known state, plus scene settings
    /// when answering as host.
    pub fn sync_response(&self, include_scene: bool) -> Message {
        Message::SyncResponse(SyncResponse {
            avatar_states: self.avatars.all().cloned().collect(),
            scene_settings: include_scene.then(|| self.scene.clone()),
        })
    }

    // -- inbound ------------------------------------------------------------

    /// Apply an inbound state message. Other message kinds are ignored.
    pub fn apply(&mut self, envelope: &Envelope) -> SyncEffects {
        let mut effects = SyncEffects::default();
        match &envelope.message {
            Message::AvatarState(state) => {
                self.apply_full(state.as_ref().clone(), &envelope.sender, &mut effects);
            }
            Message::SyncResponse(response) => {
                for state in &response.avatar_states {
                    self.apply_full(state.clone(), &envelope.sender, &mut effects);
                }
                if let Some(scene) = &response.scene_settings {
                    self.scene = scene.clone();
                    if scene.has_background {
                        self.request_once(&envelope.sender, AssetKind::Background, &mut effects);
                    }
                    effects.scene = Some(scene.clone());
                }
            }
            Message::PoseUpdate(update) => {
                let outcome = self
                    .avatars
                    .apply_pose(&envelope.sender, update, envelope.timestamp_ms);
                self.record(outcome, &envelope.sender, envelope, &mut effects);
            }
            Message::ExpressionUpdate(update) => {
                let outcome =
                    self.avatars
                        .apply_expressions(&envelope.sender, update, envelope.timestamp_ms);
                self.record(outcome, &envelope.sender, envelope, &mut effects);
            }
            _ => {}
        }
        effects
    }

    fn apply_full(&mut self, state: AvatarState, via: &PeerId, effects: &mut SyncEffects) {
        let peer = state.peer_id.clone();
        let has_asset = state.has_asset;
        let had_asset = self.avatars.get(&peer).is_some_and(|known| known.has_asset);
        let outcome = self.avatars.apply_full(state);
        match outcome {
            ApplyOutcome::Applied => {
                effects.updated.push(peer.clone());
                if has_asset && !had_asset {
                    // re-announced after a withdrawal: fetch the new model
                    self.received_assets.remove(&(peer.clone(), AssetKind::Avatar));
                }
                if has_asset {
                    self.request_once(&peer, AssetKind::Avatar, effects);
                }
            }
            ApplyOutcome::SelfEcho => {
                tracing::warn!("Ignoring avatar state for the local peer relayed by {}", via);
            }
            ApplyOutcome::Stale => {
                tracing::trace!("Ignoring stale avatar state for {}", peer);
            }
        }
    }

    fn record(&mut self, outcome: ApplyOutcome, peer: &PeerId, envelope: &Envelope, effects: &mut SyncEffects) {
        match outcome {
            ApplyOutcome::Applied => effects.updated.push(peer.clone()),
            ApplyOutcome::SelfEcho => {
                tracing::warn!("Ignoring {} echoed back to its sender", envelope.message.kind());
            }
            ApplyOutcome::Stale => {
                tracing::trace!("Ignoring stale {} from {}", envelope.message.kind(), peer);
            }
        }
    }

    fn request_once(&mut self, owner: &PeerId, asset: AssetKind, effects: &mut SyncEffects) {
        if owner == self.avatars.local_id() {
            return;
        }
        let key = (owner.clone(), asset);
        if self.received_assets.contains(&key) || self.pending_requests.contains(&key) {
            return;
        }
        self.pending_requests.insert(key.clone());
        effects.asset_requests.push(key);
    }

    // -- asset bookkeeping --------------------------------------------------

    /// An asset from `peer` finished reassembly.
    pub fn asset_received(&mut self, peer: &PeerId, asset: AssetKind) {
        self.pending_requests.remove(&(peer.clone(), asset));
        self.received_assets.insert((peer.clone(), asset));
    }

    /// A transfer from `peer` failed; the next announcement may re-request.
    pub fn asset_failed(&mut self, peer: &PeerId, asset: AssetKind) {
        self.pending_requests.remove(&(peer.clone(), asset));
    }

    /// Whether a request for `(peer, asset)` is outstanding.
    pub fn is_pending(&self, peer: &PeerId, asset: AssetKind) -> bool {
        self.pending_requests.contains(&(peer.clone(), asset))
    }

    /// Mark a local asset as available (or not) for peers to request.
    ///
    /// An avatar change restamps the local state so peers holding newer
    /// partial updates do not discard the announcement as stale.
    pub fn set_local_asset(&mut self, asset: AssetKind, available: bool, now: u64) {
        match asset {
            AssetKind::Avatar => {
                self.has_avatar = available;
                if let Some(local) = self.avatars.local_mut() {
                    local.has_asset = available;
                    local.timestamp_ms = local.timestamp_ms.max(now);
                }
            }
            AssetKind::Background => self.scene.has_background = available,
        }
    }

    /// Set the local display name carried in outgoing full states.
    pub fn set_display_name(&mut self, display_name: &str) {
        self.display_name = display_name.to_string();
        if let Some(local) = self.avatars.local_mut() {
            local.display_name = display_name.to_string();
        }
    }

    /// Record a display name learned from `peer-joined`.
    pub fn note_peer(&mut self, peer: &PeerId, display_name: &str) {
        self.avatars.set_display_name(peer, display_name);
    }

    /// The channel to `peer` closed: outstanding requests are dropped, its
    /// avatar is kept as a ghost.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        self.pending_requests.retain(|(owner, _)| owner != peer);
    }

    /// `peer` left the session explicitly.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.avatars.remove(peer);
        self.pending_requests.retain(|(owner, _)| owner != peer);
        self.received_assets.retain(|(owner, _)| owner != peer);
    }

    /// Drop every remote peer and all request bookkeeping.
    pub fn reset(&mut self) {
        self.avatars.clear_remote();
        self.pending_requests.clear();
        self.received_assets.clear();
        self.last_expressions = None;
        self.pose_limiter.reset();
        self.expression_limiter.reset();
    }

    // -- accessors ----------------------------------------------------------

    /// The avatar model.
    pub fn avatars(&self) -> &AvatarStore {
        &self.avatars
    }

    /// Current scene settings (own as host, received as guest).
    pub fn scene(&self) -> &SceneSettings {
        &self.scene
    }

    /// Options in use.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }
}
