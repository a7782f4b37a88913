//! Remote State Filter: adaptive low-pass filtering, an interpolation
//! buffer on the local timeline, and exponential output smoothing.
//!
//! Each channel of a remote avatar (root rotation, position, every bone
//! rotation and translation, every expression weight) runs through:
//!
//! 1. an adaptive filter whose cutoff rises with the signal's speed,
//! 2. an interpolation buffer sampled at `render_time - delay`,
//! 3. an exponential blend toward that sample.
//!
//! Rotations are kept on one quaternion hemisphere before filtering and
//! renormalized afterwards.

use std::collections::{BTreeMap, VecDeque};
use std::f32::consts::TAU;
use std::time::Duration;

use glam::{Quat, Vec3};
use marionette_net::{AvatarState, PeerId};

/// Filter and smoothing settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOptions {
    /// Cutoff (Hz) for a signal at rest.
    pub min_cutoff: f32,
    /// How fast the cutoff rises with speed.
    pub beta: f32,
    /// Cutoff (Hz) for the speed estimate.
    pub derivative_cutoff: f32,
    /// How far behind real time remote avatars are rendered.
    pub interpolation_delay: Duration,
    /// Samples kept per channel.
    pub buffer_len: usize,
    /// Weight of the previous output in the final blend, `[0, 1)`.
    pub smoothing: f32,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            min_cutoff: 1.0,
            beta: 0.3,
            derivative_cutoff: 1.0,
            interpolation_delay: Duration::from_millis(50),
            buffer_len: 8,
            smoothing: 0.5,
        }
    }
}

impl From<&marionette_config::FilterConfig> for FilterOptions {
    fn from(config: &marionette_config::FilterConfig) -> Self {
        Self {
            min_cutoff: config.min_cutoff.max(f32::EPSILON),
            beta: config.beta.max(0.0),
            derivative_cutoff: config.derivative_cutoff.max(f32::EPSILON),
            interpolation_delay: Duration::from_millis(config.interpolation_delay_ms),
            buffer_len: config.buffer_len.max(2),
            smoothing: config.smoothing.clamp(0.0, 0.99),
        }
    }
}

/// Exponential smoothing factor for a low-pass at `cutoff_hz` sampled
/// every `dt_secs`.
pub fn smoothing_alpha(cutoff_hz: f32, dt_secs: f32) -> f32 {
    let tau = 1.0 / (TAU * cutoff_hz);
    1.0 / (1.0 + tau / dt_secs)
}

/// A value that can be filtered component-wise.
pub trait Signal: Copy {
    /// Components, padded with zeros.
    fn to_array(self) -> [f32; 4];
    /// Rebuild from components.
    fn from_array(components: [f32; 4]) -> Self;
    /// Representation of `self` closest to `previous`.
    fn align(self, _previous: Self) -> Self {
        self
    }
    /// Bring a filtered value back into the valid domain.
    fn normalize(self) -> Self {
        self
    }
    /// Interpolate from `self` to `other` by `t` in `[0, 1]`.
    fn blend(self, other: Self, t: f32) -> Self;
}

impl Signal for f32 {
    fn to_array(self) -> [f32; 4] {
        [self, 0.0, 0.0, 0.0]
    }

    fn from_array(components: [f32; 4]) -> Self {
        components[0]
    }

    fn blend(self, other: Self, t: f32) -> Self {
        self + (other - self) * t
    }
}

impl Signal for Vec3 {
    fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.z, 0.0]
    }

    fn from_array(c: [f32; 4]) -> Self {
        Vec3::new(c[0], c[1], c[2])
    }

    fn blend(self, other: Self, t: f32) -> Self {
        self.lerp(other, t)
    }
}

impl Signal for Quat {
    fn to_array(self) -> [f32; 4] {
        Quat::to_array(&self)
    }

    fn from_array(c: [f32; 4]) -> Self {
        Quat::from_array(c)
    }

    fn align(self, previous: Self) -> Self {
        if self.dot(previous) < 0.0 { -self } else { self }
    }

    fn normalize(self) -> Self {
        let length = self.length();
        if length > f32::EPSILON {
            self / length
        } else {
            Quat::IDENTITY
        }
    }

    fn blend(self, other: Self, t: f32) -> Self {
        self.slerp(other, t)
    }
}

#[derive(Debug, Clone, Copy)]
struct FilterState<S> {
    value: S,
    derivative: [f32; 4],
    t_ms: u64,
}

/// Adaptive low-pass filter: heavy smoothing at rest, little lag in motion.
#[derive(Debug, Clone)]
pub struct AdaptiveFilter<S: Signal> {
    min_cutoff: f32,
    beta: f32,
    derivative_cutoff: f32,
    state: Option<FilterState<S>>,
}

impl<S: Signal> AdaptiveFilter<S> {
    /// Filter with the given tuning.
    pub fn new(options: &FilterOptions) -> Self {
        Self {
            min_cutoff: options.min_cutoff,
            beta: options.beta,
            derivative_cutoff: options.derivative_cutoff,
            state: None,
        }
    }

    /// Filter a sample taken at `t_ms`.
    ///
    /// Returns `None` for samples not newer than the last one; they leave
    /// the filter untouched.
    pub fn filter(&mut self, value: S, t_ms: u64) -> Option<S> {
        let Some(prev) = self.state else {
            let value = value.normalize();
            self.state = Some(FilterState {
                value,
                derivative: [0.0; 4],
                t_ms,
            });
            return Some(value);
        };
        if t_ms <= prev.t_ms {
            return None;
        }

        let dt = (t_ms - prev.t_ms) as f32 / 1000.0;
        let x = value.align(prev.value).to_array();
        let p = prev.value.to_array();

        let a_d = smoothing_alpha(self.derivative_cutoff, dt);
        let mut derivative = [0.0; 4];
        for i in 0..4 {
            let raw = (x[i] - p[i]) / dt;
            derivative[i] = a_d * raw + (1.0 - a_d) * prev.derivative[i];
        }
        let speed = derivative.iter().map(|d| d * d).sum::<f32>().sqrt();

        let a = smoothing_alpha(self.min_cutoff + self.beta * speed, dt);
        let mut out = [0.0; 4];
        for i in 0..4 {
            out[i] = a * x[i] + (1.0 - a) * p[i];
        }
        let value = S::from_array(out).normalize();
        self.state = Some(FilterState {
            value,
            derivative,
            t_ms,
        });
        Some(value)
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

/// Timestamped samples on the local timeline, oldest first.
#[derive(Debug, Clone)]
pub struct InterpolationBuffer<S> {
    samples: VecDeque<(u64, S)>,
    capacity: usize,
}

impl<S: Signal> InterpolationBuffer<S> {
    /// Buffer keeping at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Insert in time order. A sample at an existing time replaces it.
    pub fn insert(&mut self, t_ms: u64, value: S) {
        let at = self.samples.partition_point(|(t, _)| *t < t_ms);
        match self.samples.get_mut(at) {
            Some(slot) if slot.0 == t_ms => slot.1 = value,
            _ => self.samples.insert(at, (t_ms, value)),
        }
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Value at `t_ms`: interpolated between the bracketing samples, held
    /// at the ends.
    pub fn sample(&self, t_ms: u64) -> Option<S> {
        let (first_t, first) = *self.samples.front()?;
        let (last_t, last) = *self.samples.back()?;
        if t_ms <= first_t {
            return Some(first);
        }
        if t_ms >= last_t {
            return Some(last);
        }
        let upper = self.samples.partition_point(|(t, _)| *t <= t_ms);
        let (t1, v1) = self.samples[upper];
        let (t0, v0) = self.samples[upper - 1];
        let frac = (t_ms - t0) as f32 / (t1 - t0) as f32;
        Some(v0.blend(v1, frac))
    }

    /// Samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// One channel through all three stages.
#[derive(Debug, Clone)]
pub struct SmoothedChannel<S: Signal> {
    filter: AdaptiveFilter<S>,
    buffer: InterpolationBuffer<S>,
    output: Option<S>,
}

impl<S: Signal> SmoothedChannel<S> {
    /// Empty channel.
    pub fn new(options: &FilterOptions) -> Self {
        Self {
            filter: AdaptiveFilter::new(options),
            buffer: InterpolationBuffer::new(options.buffer_len),
            output: None,
        }
    }

    /// Feed a sample stamped `remote_ms` that maps to `local_ms`.
    pub fn push(&mut self, value: S, remote_ms: u64, local_ms: u64) {
        // late samples skip the filter but still fill gaps in the buffer
        let value = self.filter.filter(value, remote_ms).unwrap_or(value);
        self.buffer.insert(local_ms, value);
    }

    /// Output at `render_ms`, blended with the previous output.
    pub fn render(&mut self, render_ms: u64, smoothing: f32) -> Option<S> {
        let target = self.buffer.sample(render_ms)?;
        let value = match self.output {
            Some(previous) => previous.blend(target, 1.0 - smoothing).normalize(),
            None => target,
        };
        self.output = Some(value);
        Some(value)
    }
}

/// Maps a remote clock onto the local one.
///
/// The estimate is the smallest `arrival - remote` seen, i.e. the sample
/// that travelled fastest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockOffset {
    offset: Option<i64>,
}

impl ClockOffset {
    /// Record an arrival and return the sample's local time.
    pub fn observe(&mut self, remote_ms: u64, arrival_ms: u64) -> u64 {
        let observed = arrival_ms as i64 - remote_ms as i64;
        let offset = self.offset.map_or(observed, |o| o.min(observed));
        self.offset = Some(offset);
        self.to_local(remote_ms)
    }

    /// Local time of a remote timestamp.
    pub fn to_local(&self, remote_ms: u64) -> u64 {
        (remote_ms as i64 + self.offset.unwrap_or(0)).max(0) as u64
    }
}

#[derive(Debug, Clone)]
struct PeerFilter {
    clock: ClockOffset,
    root_rotation: SmoothedChannel<Vec3>,
    position: SmoothedChannel<Vec3>,
    bone_rotations: BTreeMap<String, SmoothedChannel<Quat>>,
    bone_positions: BTreeMap<String, SmoothedChannel<Vec3>>,
    expressions: BTreeMap<String, SmoothedChannel<f32>>,
    latest: AvatarState,
}

impl PeerFilter {
    fn new(options: &FilterOptions, state: &AvatarState) -> Self {
        Self {
            clock: ClockOffset::default(),
            root_rotation: SmoothedChannel::new(options),
            position: SmoothedChannel::new(options),
            bone_rotations: BTreeMap::new(),
            bone_positions: BTreeMap::new(),
            expressions: BTreeMap::new(),
            latest: state.clone(),
        }
    }
}

/// Smoothing state for every remote peer.
#[derive(Debug, Clone, Default)]
pub struct RemoteStateFilter {
    options: FilterOptions,
    peers: BTreeMap<PeerId, PeerFilter>,
}

impl RemoteStateFilter {
    /// Empty filter.
    pub fn new(options: FilterOptions) -> Self {
        Self {
            options,
            peers: BTreeMap::new(),
        }
    }

    /// Feed the merged state of a remote peer that arrived at `arrival_ms`.
    pub fn ingest(&mut self, state: &AvatarState, arrival_ms: u64) {
        let options = &self.options;
        let peer = self
            .peers
            .entry(state.peer_id.clone())
            .or_insert_with(|| PeerFilter::new(options, state));

        let remote = state.timestamp_ms;
        let local = peer.clock.observe(remote, arrival_ms);
        peer.root_rotation.push(state.root_rotation, remote, local);
        peer.position.push(state.position, remote, local);
        for (bone, transform) in &state.pose {
            peer.bone_rotations
                .entry(bone.clone())
                .or_insert_with(|| SmoothedChannel::new(options))
                .push(transform.rotation, remote, local);
            if let Some(position) = transform.position {
                peer.bone_positions
                    .entry(bone.clone())
                    .or_insert_with(|| SmoothedChannel::new(options))
                    .push(position, remote, local);
            }
        }
        for (name, weight) in &state.expressions {
            peer.expressions
                .entry(name.clone())
                .or_insert_with(|| SmoothedChannel::new(options))
                .push(*weight, remote, local);
        }
        peer.latest = state.clone();
    }

    /// Smoothed state of `peer` for a frame rendered at `now_ms`.
    pub fn render(&mut self, peer: &PeerId, now_ms: u64) -> Option<AvatarState> {
        let delay = self.options.interpolation_delay.as_millis() as u64;
        let smoothing = self.options.smoothing;
        let filter = self.peers.get_mut(peer)?;
        let at = now_ms.saturating_sub(delay);

        let mut state = filter.latest.clone();
        if let Some(rotation) = filter.root_rotation.render(at, smoothing) {
            state.root_rotation = rotation;
        }
        if let Some(position) = filter.position.render(at, smoothing) {
            state.position = position;
        }
        for (bone, transform) in state.pose.iter_mut() {
            if let Some(rotation) = filter
                .bone_rotations
                .get_mut(bone)
                .and_then(|c| c.render(at, smoothing))
            {
                transform.rotation = rotation;
            }
            if transform.position.is_some() {
                transform.position = filter
                    .bone_positions
                    .get_mut(bone)
                    .and_then(|c| c.render(at, smoothing))
                    .or(transform.position);
            }
        }
        for (name, weight) in state.expressions.iter_mut() {
            if let Some(value) = filter
                .expressions
                .get_mut(name)
                .and_then(|c| c.render(at, smoothing))
            {
                *weight = value.clamp(0.0, 1.0);
            }
        }
        Some(state)
    }

    /// Smoothed states of every tracked peer, ordered by peer id.
    pub fn render_all(&mut self, now_ms: u64) -> Vec<AvatarState> {
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        peers
            .iter()
            .filter_map(|peer| self.render(peer, now_ms))
            .collect()
    }

    /// Discard all history for `peer`.
    pub fn reset(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_some() {
            tracing::debug!("Reset smoothing history for {}", peer);
        }
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Whether `peer` has history.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Options in use.
    pub fn options(&self) -> &FilterOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responsive() -> FilterOptions {
        FilterOptions {
            min_cutoff: 1_000.0,
            beta: 0.0,
            smoothing: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_alpha_grows_with_cutoff_and_dt() {
        let slow = smoothing_alpha(1.0, 0.033);
        assert!(slow > 0.0 && slow < 1.0);
        assert!(smoothing_alpha(10.0, 0.033) > slow);
        assert!(smoothing_alpha(1.0, 0.1) > slow);
    }

    #[test]
    fn test_constant_signal_passes_unchanged() {
        let mut filter = AdaptiveFilter::new(&FilterOptions::default());
        for i in 0..10 {
            let out = filter.filter(Vec3::splat(2.0), i * 33).unwrap();
            assert!((out - Vec3::splat(2.0)).length() < 1e-5);
        }
    }

    #[test]
    fn test_fast_motion_filters_less() {
        let mut still = AdaptiveFilter::new(&FilterOptions {
            beta: 0.0,
            ..Default::default()
        });
        let mut adaptive = AdaptiveFilter::new(&FilterOptions {
            beta: 5.0,
            ..Default::default()
        });
        still.filter(0.0_f32, 0);
        adaptive.filter(0.0_f32, 0);
        let lagging = still.filter(10.0, 33).unwrap();
        let tracking = adaptive.filter(10.0, 33).unwrap();
        assert!(lagging < 10.0);
        assert!(tracking > lagging);
    }

    #[test]
    fn test_out_of_order_sample_is_skipped() {
        let mut filter = AdaptiveFilter::new(&FilterOptions::default());
        filter.filter(1.0_f32, 100);
        assert!(filter.filter(5.0, 100).is_none());
        assert!(filter.filter(5.0, 50).is_none());
    }

    #[test]
    fn test_quaternion_sign_flip_is_not_a_jump() {
        let q = Quat::from_rotation_y(0.5);
        let mut filter = AdaptiveFilter::new(&FilterOptions::default());
        filter.filter(q, 0);
        let out = filter.filter(-q, 33).unwrap();
        assert!(out.angle_between(q) < 1e-3);
        assert!((out.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_buffer_interpolates_between_brackets() {
        let mut buffer = InterpolationBuffer::new(4);
        buffer.insert(100, 10.0_f32);
        buffer.insert(0, 0.0);
        assert_eq!(buffer.sample(50), Some(5.0));
        assert_eq!(buffer.sample(0), Some(0.0));
        assert_eq!(buffer.sample(500), Some(10.0));

        for t in 2..6 {
            buffer.insert(t * 100, t as f32 * 10.0);
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.sample(0), Some(20.0));
    }

    #[test]
    fn test_buffer_slerps_rotations() {
        let mut buffer = InterpolationBuffer::new(4);
        buffer.insert(0, Quat::IDENTITY);
        buffer.insert(100, Quat::from_rotation_z(1.0));
        let mid = buffer.sample(50).unwrap();
        assert!(mid.angle_between(Quat::from_rotation_z(0.5)) < 1e-4);
    }

    #[test]
    fn test_clock_offset_uses_fastest_sample() {
        let mut clock = ClockOffset::default();
        assert_eq!(clock.observe(1_000, 1_030), 1_030);
        assert_eq!(clock.observe(1_100, 1_110), 1_110);
        assert_eq!(clock.observe(1_200, 1_260), 1_210);
    }

    #[test]
    fn test_render_interpolates_behind_real_time() {
        let mut filter = RemoteStateFilter::new(responsive());
        let peer = PeerId::from("a");
        let mut state = AvatarState {
            peer_id: peer.clone(),
            timestamp_ms: 1_000,
            ..Default::default()
        };
        filter.ingest(&state, 1_010);
        state.position = Vec3::new(10.0, 0.0, 0.0);
        state.timestamp_ms = 1_100;
        filter.ingest(&state, 1_115);

        let rendered = filter.render(&peer, 1_110).unwrap();
        assert!((rendered.position.x - 5.0).abs() < 0.1);
        assert_eq!(rendered.peer_id, peer);
    }

    #[test]
    fn test_expression_output_is_clamped() {
        let mut filter = RemoteStateFilter::new(responsive());
        let mut state = AvatarState {
            peer_id: PeerId::from("a"),
            timestamp_ms: 10,
            ..Default::default()
        };
        state.expressions.insert("smile".into(), 1.0);
        filter.ingest(&state, 10);
        let rendered = filter.render(&PeerId::from("a"), 1_000).unwrap();
        assert!(rendered.expressions["smile"] <= 1.0);
    }

    #[test]
    fn test_reset_discards_history() {
        let mut filter = RemoteStateFilter::default();
        let state = AvatarState {
            peer_id: PeerId::from("a"),
            ..Default::default()
        };
        filter.ingest(&state, 0);
        assert!(filter.contains(&PeerId::from("a")));
        filter.reset(&PeerId::from("a"));
        assert!(filter.render(&PeerId::from("a"), 100).is_none());
        assert!(filter.render_all(100).is_empty());
    }
}
