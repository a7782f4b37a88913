//! Headless renderer stand-in for the loopback demo.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use glam::{Quat, Vec3};
use marionette_net::{AssetKind, AvatarState, BoneTransform, PeerId};
use marionette_sync::{ProgressObserver, Renderer, RendererError, TransferProgress, TransferStatus};

/// Animates a swaying avatar and records what it receives.
pub struct Puppet {
    label: String,
    started: Instant,
    remote: Mutex<BTreeMap<PeerId, AvatarState>>,
}

impl Puppet {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            started: Instant::now(),
            remote: Mutex::new(BTreeMap::new()),
        }
    }

    /// Last smoothed state shown for each remote peer.
    pub fn remote_states(&self) -> Vec<AvatarState> {
        match self.remote.lock() {
            Ok(remote) => remote.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }
}

impl Renderer for Puppet {
    fn local_sampled_state(&self) -> Option<AvatarState> {
        let t = self.started.elapsed().as_secs_f32();
        let mut pose = BTreeMap::new();
        pose.insert(
            "head".to_string(),
            BoneTransform {
                rotation: Quat::from_rotation_y(0.4 * t.sin()),
                position: None,
            },
        );
        let mut expressions = BTreeMap::new();
        expressions.insert("happy".to_string(), 0.5 + 0.5 * (0.7 * t).sin());
        Some(AvatarState {
            position: Vec3::new(0.2 * t.sin(), 0.0, 0.0),
            root_rotation: Vec3::new(0.0, 0.1 * t.cos(), 0.0),
            pose,
            expressions,
            ..Default::default()
        })
    }

    fn apply_remote_state(&self, peer: &PeerId, state: &AvatarState) {
        if let Ok(mut remote) = self.remote.lock() {
            remote.insert(peer.clone(), state.clone());
        }
    }

    async fn on_asset_reassembled(
        &self,
        peer: &PeerId,
        asset: AssetKind,
        bytes: Vec<u8>,
    ) -> Result<(), RendererError> {
        if bytes.is_empty() {
            return Err(RendererError::Rejected("empty asset".to_string()));
        }
        tracing::info!(
            "[{}] loaded {:?} from {} ({} bytes)",
            self.label,
            asset,
            peer,
            bytes.len()
        );
        Ok(())
    }
}

/// Logs transfer milestones.
pub struct ProgressLog;

impl ProgressObserver for ProgressLog {
    fn on_transfer_progress(&self, progress: &TransferProgress) {
        match progress.status {
            TransferStatus::Transferring => tracing::debug!(
                "{:?} {:?} with {}: {}/{}",
                progress.direction,
                progress.asset,
                progress.peer_id,
                progress.chunks_complete,
                progress.total_chunks
            ),
            status => tracing::info!(
                "{:?} {:?} with {}: {:?} ({} chunks)",
                progress.direction,
                progress.asset,
                progress.peer_id,
                status,
                progress.total_chunks
            ),
        }
    }
}
