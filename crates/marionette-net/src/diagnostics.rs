//! Heartbeat latency tracking: last/average/min/max latency, jitter and
//! unanswered-ping rate per peer.
//!
//! Timestamps are wall-clock milliseconds as carried by `ping`/`pong`.

use std::collections::VecDeque;

/// Default number of latency samples kept per peer.
pub const DEFAULT_WINDOW: usize = 32;

/// Rolling window of heartbeat latency samples for one peer.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    window_size: usize,
    samples: VecDeque<u64>,
    /// `sent_at` of pings still waiting for a pong, oldest first.
    pending: VecDeque<u64>,
    pings_sent: u64,
    pongs_received: u64,
    ping_timeout_ms: u64,
}

impl LatencyTracker {
    /// Create a tracker keeping `window_size` samples. Pings unanswered for
    /// longer than `ping_timeout_ms` count as lost.
    pub fn new(window_size: usize, ping_timeout_ms: u64) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            samples: VecDeque::with_capacity(window_size),
            pending: VecDeque::new(),
            pings_sent: 0,
            pongs_received: 0,
            ping_timeout_ms,
        }
    }

    /// Record that a ping stamped `sent_at` went out.
    pub fn on_ping_sent(&mut self, sent_at: u64) {
        self.pending.push_back(sent_at);
        self.pings_sent += 1;
    }

    /// Record a pong echoing `sent_at`, received at local time `now`.
    ///
    /// Returns the measured latency `now - sent_at`.
    pub fn on_pong(&mut self, sent_at: u64, now: u64) -> u64 {
        let latency = now.saturating_sub(sent_at);
        if let Some(pos) = self.pending.iter().position(|&t| t == sent_at) {
            self.pending.remove(pos);
        }
        if self.samples.len() >= self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
        self.pongs_received += 1;
        latency
    }

    /// Drop pending pings older than the timeout.
    pub fn expire_pending(&mut self, now: u64) {
        while let Some(&front) = self.pending.front() {
            if now.saturating_sub(front) > self.ping_timeout_ms {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }

    /// Most recent latency sample.
    pub fn latest(&self) -> Option<u64> {
        self.samples.back().copied()
    }

    /// Average latency over the window.
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }

    /// Minimum latency in the window.
    pub fn min(&self) -> Option<u64> {
        self.samples.iter().min().copied()
    }

    /// Maximum latency in the window.
    pub fn max(&self) -> Option<u64> {
        self.samples.iter().max().copied()
    }

    /// Standard deviation of the window, in milliseconds.
    pub fn jitter(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let n = self.samples.len() as f64;
        let avg = self.samples.iter().sum::<u64>() as f64 / n;
        let variance = self
            .samples
            .iter()
            .map(|&s| {
                let diff = s as f64 - avg;
                diff * diff
            })
            .sum::<f64>()
            / (n - 1.0);
        Some(variance.sqrt())
    }

    /// Fraction of pings that were never answered (0.0 to 1.0). Pings still
    /// in flight do not count as lost.
    pub fn loss_rate(&self) -> f64 {
        if self.pings_sent == 0 {
            return 0.0;
        }
        let lost = self
            .pings_sent
            .saturating_sub(self.pongs_received)
            .saturating_sub(self.pending.len() as u64);
        lost as f64 / self.pings_sent as f64
    }

    /// Immutable snapshot of the current statistics.
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            latest_ms: self.latest(),
            average_ms: self.average(),
            min_ms: self.min(),
            max_ms: self.max(),
            jitter_ms: self.jitter(),
            loss_rate: self.loss_rate(),
            sample_count: self.samples.len(),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, 10_000)
    }
}

/// Latency statistics for one peer, exposed to UI layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencySnapshot {
    /// Most recent heartbeat latency.
    pub latest_ms: Option<u64>,
    /// Window average.
    pub average_ms: Option<u64>,
    /// Window minimum.
    pub min_ms: Option<u64>,
    /// Window maximum.
    pub max_ms: Option<u64>,
    /// Standard deviation of the window.
    pub jitter_ms: Option<f64>,
    /// Unanswered ping fraction.
    pub loss_rate: f64,
    /// Samples in the window.
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_records_latency() {
        let mut tracker = LatencyTracker::default();
        tracker.on_ping_sent(1_000);
        assert_eq!(tracker.on_pong(1_000, 1_045), 45);
        assert_eq!(tracker.latest(), Some(45));
        assert_eq!(tracker.loss_rate(), 0.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut tracker = LatencyTracker::new(3, 10_000);
        for (i, latency) in [10u64, 20, 30, 40].into_iter().enumerate() {
            let sent = i as u64 * 100;
            tracker.on_ping_sent(sent);
            tracker.on_pong(sent, sent + latency);
        }
        assert_eq!(tracker.min(), Some(20));
        assert_eq!(tracker.max(), Some(40));
        assert_eq!(tracker.average(), Some(30));
        assert_eq!(tracker.snapshot().sample_count, 3);
    }

    #[test]
    fn test_jitter_needs_two_samples() {
        let mut tracker = LatencyTracker::default();
        assert!(tracker.jitter().is_none());
        tracker.on_pong(0, 10);
        assert!(tracker.jitter().is_none());
        tracker.on_pong(100, 130);
        let jitter = tracker.jitter().unwrap();
        assert!((jitter - 14.142).abs() < 0.01, "got {jitter}");
    }

    #[test]
    fn test_expired_pings_count_as_lost() {
        let mut tracker = LatencyTracker::new(8, 1_000);
        tracker.on_ping_sent(0);
        tracker.on_ping_sent(500);
        assert_eq!(tracker.loss_rate(), 0.0, "in-flight pings are not lost");

        tracker.expire_pending(1_200);
        assert_eq!(tracker.loss_rate(), 0.5);
    }

    #[test]
    fn test_clock_skew_never_underflows() {
        let mut tracker = LatencyTracker::default();
        assert_eq!(tracker.on_pong(2_000, 1_990), 0);
    }
}
