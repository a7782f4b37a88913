//! Per-peer avatar model with self-echo suppression and last-write-wins
//! reconciliation.
//!
//! The local entry is written only by the local sampling loop. Inbound
//! messages can touch every other entry, never the local one.

use std::collections::BTreeMap;

use marionette_net::{AvatarState, ExpressionUpdate, PeerId, PoseUpdate};

/// What happened to an inbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The stored state changed.
    Applied,
    /// The update targeted the local peer and was ignored.
    SelfEcho,
    /// The update was older than the stored state and was ignored.
    Stale,
}

/// Merge a partial pose update into `state`. Absent fields are kept.
pub fn merge_pose(state: &mut AvatarState, update: &PoseUpdate) {
    for (bone, transform) in &update.pose {
        state.pose.insert(bone.clone(), *transform);
    }
    if let Some(rotation) = update.root_rotation {
        state.root_rotation = rotation;
    }
    if let Some(position) = update.position {
        state.position = position;
    }
}

/// Merge blend shape weights into `state`, clamped to `[0, 1]`.
pub fn merge_expressions(state: &mut AvatarState, update: &ExpressionUpdate) {
    for (name, weight) in &update.expressions {
        state.expressions.insert(name.clone(), weight.clamp(0.0, 1.0));
    }
}

/// Exactly one [`AvatarState`] per known peer, the local one included.
#[derive(Debug, Clone)]
pub struct AvatarStore {
    local: PeerId,
    states: BTreeMap<PeerId, AvatarState>,
}

impl AvatarStore {
    /// Empty store for `local`.
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            states: BTreeMap::new(),
        }
    }

    /// The local peer id.
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Replace the local entry. The owner id is forced to the local peer.
    pub fn set_local(&mut self, mut state: AvatarState) {
        state.peer_id = self.local.clone();
        self.states.insert(self.local.clone(), state);
    }

    /// Mutable access to the local entry, if one has been sampled.
    pub fn local_mut(&mut self) -> Option<&mut AvatarState> {
        self.states.get_mut(&self.local)
    }

    /// The local entry, if one has been sampled.
    pub fn local(&self) -> Option<&AvatarState> {
        self.states.get(&self.local)
    }

    /// Apply a full `avatar-state`; every field is replaced.
    ///
    /// Last write wins by `timestamp_ms`; equal timestamps apply, so the
    /// later arrival wins a tie.
    pub fn apply_full(&mut self, state: AvatarState) -> ApplyOutcome {
        if state.peer_id == self.local {
            return ApplyOutcome::SelfEcho;
        }
        if let Some(existing) = self.states.get(&state.peer_id) {
            if state.timestamp_ms < existing.timestamp_ms {
                return ApplyOutcome::Stale;
            }
        }
        self.states.insert(state.peer_id.clone(), state);
        ApplyOutcome::Applied
    }

    fn partial(&mut self, peer: &PeerId, timestamp_ms: u64) -> Result<&mut AvatarState, ApplyOutcome> {
        if peer == &self.local {
            return Err(ApplyOutcome::SelfEcho);
        }
        let state = self.states.entry(peer.clone()).or_insert_with(|| AvatarState {
            peer_id: peer.clone(),
            ..Default::default()
        });
        if timestamp_ms < state.timestamp_ms {
            return Err(ApplyOutcome::Stale);
        }
        state.timestamp_ms = timestamp_ms;
        Ok(state)
    }

    /// Merge a `pose-update` from `peer` stamped `timestamp_ms`.
    pub fn apply_pose(&mut self, peer: &PeerId, update: &PoseUpdate, timestamp_ms: u64) -> ApplyOutcome {
        match self.partial(peer, timestamp_ms) {
            Ok(state) => {
                merge_pose(state, update);
                ApplyOutcome::Applied
            }
            Err(outcome) => outcome,
        }
    }

    /// Merge an `expression-update` from `peer` stamped `timestamp_ms`.
    pub fn apply_expressions(
        &mut self,
        peer: &PeerId,
        update: &ExpressionUpdate,
        timestamp_ms: u64,
    ) -> ApplyOutcome {
        match self.partial(peer, timestamp_ms) {
            Ok(state) => {
                merge_expressions(state, update);
                ApplyOutcome::Applied
            }
            Err(outcome) => outcome,
        }
    }

    /// Update a remote peer's display name, creating its entry if needed.
    pub fn set_display_name(&mut self, peer: &PeerId, display_name: &str) {
        if peer == &self.local {
            return;
        }
        let state = self.states.entry(peer.clone()).or_insert_with(|| AvatarState {
            peer_id: peer.clone(),
            ..Default::default()
        });
        state.display_name = display_name.to_string();
    }

    /// Look up one entry.
    pub fn get(&self, peer: &PeerId) -> Option<&AvatarState> {
        self.states.get(peer)
    }

    /// Every entry, local included, sorted by peer id.
    pub fn all(&self) -> impl Iterator<Item = &AvatarState> {
        self.states.values()
    }

    /// Every remote entry.
    pub fn remote(&self) -> impl Iterator<Item = &AvatarState> {
        self.states.values().filter(|s| s.peer_id != self.local)
    }

    /// Forget a remote peer.
    pub fn remove(&mut self, peer: &PeerId) -> Option<AvatarState> {
        if peer == &self.local {
            return None;
        }
        self.states.remove(peer)
    }

    /// Forget every remote peer; the local entry stays.
    pub fn clear_remote(&mut self) {
        let local = self.local.clone();
        self.states.retain(|peer, _| *peer == local);
    }

    /// Number of entries, local included.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};
    use marionette_net::BoneTransform;

    fn remote_state(peer: &str, ts: u64) -> AvatarState {
        AvatarState {
            peer_id: PeerId::from(peer),
            display_name: peer.to_uppercase(),
            position: Vec3::new(ts as f32, 0.0, 0.0),
            timestamp_ms: ts,
            ..Default::default()
        }
    }

    fn pose(bone: &str, angle: f32) -> PoseUpdate {
        let mut pose = BTreeMap::new();
        pose.insert(bone.to_string(), BoneTransform::rotation(Quat::from_rotation_x(angle)));
        PoseUpdate {
            pose,
            root_rotation: None,
            position: None,
        }
    }

    #[test]
    fn test_inbound_updates_never_touch_local_entry() {
        let mut store = AvatarStore::new(PeerId::from("me"));
        store.set_local(remote_state("whatever", 10));
        let before = store.local().cloned();

        assert_eq!(store.apply_full(remote_state("me", 99)), ApplyOutcome::SelfEcho);
        assert_eq!(
            store.apply_pose(&PeerId::from("me"), &pose("head", 1.0), 99),
            ApplyOutcome::SelfEcho
        );
        let expr = ExpressionUpdate {
            expressions: BTreeMap::from([("happy".to_string(), 1.0)]),
        };
        assert_eq!(
            store.apply_expressions(&PeerId::from("me"), &expr, 99),
            ApplyOutcome::SelfEcho
        );
        assert!(store.remove(&PeerId::from("me")).is_none());
        assert_eq!(store.local().cloned(), before);
        assert_eq!(store.local().unwrap().peer_id, PeerId::from("me"));
    }

    #[test]
    fn test_full_state_last_write_wins() {
        let mut store = AvatarStore::new(PeerId::from("me"));
        assert_eq!(store.apply_full(remote_state("a", 20)), ApplyOutcome::Applied);
        assert_eq!(store.apply_full(remote_state("a", 10)), ApplyOutcome::Stale);
        assert_eq!(store.get(&PeerId::from("a")).unwrap().timestamp_ms, 20);

        let mut tie = remote_state("a", 20);
        tie.display_name = "Later".into();
        assert_eq!(store.apply_full(tie), ApplyOutcome::Applied);
        assert_eq!(store.get(&PeerId::from("a")).unwrap().display_name, "Later");
    }

    #[test]
    fn test_partial_pose_keeps_other_fields() {
        let mut store = AvatarStore::new(PeerId::from("me"));
        let mut full = remote_state("a", 10);
        full.expressions.insert("blink".into(), 0.5);
        full.pose.insert("hips".into(), BoneTransform::rotation(Quat::IDENTITY));
        store.apply_full(full);

        assert_eq!(
            store.apply_pose(&PeerId::from("a"), &pose("head", 0.3), 11),
            ApplyOutcome::Applied
        );
        let state = store.get(&PeerId::from("a")).unwrap();
        assert_eq!(state.pose.len(), 2);
        assert_eq!(state.expressions["blink"], 0.5);
        assert_eq!(state.position, Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(state.timestamp_ms, 11);
    }

    #[test]
    fn test_stale_partial_update_dropped() {
        let mut store = AvatarStore::new(PeerId::from("me"));
        store.apply_full(remote_state("a", 50));
        assert_eq!(
            store.apply_pose(&PeerId::from("a"), &pose("head", 0.3), 40),
            ApplyOutcome::Stale
        );
        assert!(store.get(&PeerId::from("a")).unwrap().pose.is_empty());
    }

    #[test]
    fn test_expression_weights_are_clamped() {
        let mut store = AvatarStore::new(PeerId::from("me"));
        let update = ExpressionUpdate {
            expressions: BTreeMap::from([("a".to_string(), 1.7), ("b".to_string(), -0.2)]),
        };
        store.apply_expressions(&PeerId::from("x"), &update, 1);
        let state = store.get(&PeerId::from("x")).unwrap();
        assert_eq!(state.expressions["a"], 1.0);
        assert_eq!(state.expressions["b"], 0.0);
    }

    #[test]
    fn test_clear_remote_keeps_local() {
        let mut store = AvatarStore::new(PeerId::from("me"));
        assert!(store.local_mut().is_none());
        store.set_local(AvatarState::default());
        if let Some(local) = store.local_mut() {
            local.has_asset = true;
        }
        store.apply_full(remote_state("a", 1));
        store.apply_full(remote_state("b", 1));
        store.clear_remote();
        assert_eq!(store.len(), 1);
        assert!(store.local().unwrap().has_asset);
        assert_eq!(store.remote().count(), 0);
    }
}
