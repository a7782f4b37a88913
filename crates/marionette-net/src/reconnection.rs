//! Reconnection after signaling loss: in-place resume, then a bounded number
//! of full reconnection attempts with exponential backoff.
//!
//! [`ReconnectState`] computes capped, non-decreasing backoff delays.
//! [`Reconnector`] is the explicit retry state machine on top of it and
//! [`Reconnector::drive`] runs it against caller-supplied resume/attempt
//! futures, abandoning the loop as soon as its [`CancelToken`] fires.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

/// Backoff policy for full reconnection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectOptions {
    /// Delay before the first full attempt. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt. Default: 2.0.
    pub multiplier: f64,
    /// Ceiling for any single delay. Default: 10 s.
    pub max_delay: Duration,
    /// Full attempts before giving up. Default: 3.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0). Default: 0.0.
    pub jitter: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
            jitter: 0.0,
        }
    }
}

impl From<&marionette_config::ReconnectConfig> for ReconnectOptions {
    fn from(config: &marionette_config::ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Tracks the attempt count and computes the next backoff delay.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    options: ReconnectOptions,
    attempts: u32,
    current_delay: Duration,
    last_delay: Duration,
}

impl ReconnectState {
    /// Create a new state from the given options.
    pub fn new(options: ReconnectOptions) -> Self {
        let initial = options.initial_delay;
        Self {
            options,
            attempts: 0,
            current_delay: initial,
            last_delay: Duration::ZERO,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` once max attempts have been used.
    ///
    /// Delays never decrease and never exceed `max_delay`, jitter included.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.options.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts += 1;

        let jittered = if self.options.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor =
                rng.random_range((1.0 - self.options.jitter)..=(1.0 + self.options.jitter));
            base.mul_f64(factor)
        } else {
            base
        };
        let delay = jittered.min(self.options.max_delay).max(self.last_delay);
        self.last_delay = delay;

        let next = self.current_delay.mul_f64(self.options.multiplier);
        self.current_delay = next.min(self.options.max_delay);

        Some(delay)
    }

    /// Reset after a successful reconnection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.options.initial_delay;
        self.last_delay = Duration::ZERO;
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The policy in use.
    pub fn options(&self) -> &ReconnectOptions {
        &self.options
    }
}

/// Errors produced by the reconnection system.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// All configured attempts were used without success.
    #[error("maximum reconnection attempts exhausted")]
    MaxAttemptsExhausted,
    /// The session was left while reconnecting.
    #[error("reconnection cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// One-shot cancellation flag shared between a session and its handle.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ---------------------------------------------------------------------------
// Retry state machine
// ---------------------------------------------------------------------------

/// What the reconnecting session should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Try to resume the existing identity in place.
    Resume,
    /// Sleep `delay`, tear down the old identity, then make full attempt
    /// number `attempt`.
    Wait {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// Stop; the session has failed or was left.
    GiveUp(ReconnectError),
}

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Not reconnecting.
    Idle,
    /// Trying an in-place resume.
    Resuming,
    /// Backing off before a full attempt.
    Waiting {
        /// Upcoming attempt number.
        attempt: u32,
    },
    /// A full attempt is in progress.
    Attempting {
        /// Attempt number.
        attempt: u32,
    },
    /// The last resume or attempt succeeded.
    Recovered,
    /// Attempts exhausted.
    Exhausted,
    /// Abandoned through the cancel token.
    Cancelled,
}

/// Explicit reconnection state machine with a bounded attempt counter.
#[derive(Debug)]
pub struct Reconnector {
    state: ReconnectState,
    phase: ReconnectPhase,
    cancel: CancelToken,
}

impl Reconnector {
    /// Create a reconnector that stops when `cancel` fires.
    pub fn new(options: ReconnectOptions, cancel: CancelToken) -> Self {
        Self {
            state: ReconnectState::new(options),
            phase: ReconnectPhase::Idle,
            cancel,
        }
    }

    /// Start a reconnection episode. The first step is always a resume.
    pub fn begin(&mut self) -> ReconnectStep {
        self.state.reset();
        if self.cancel.is_cancelled() {
            self.phase = ReconnectPhase::Cancelled;
            return ReconnectStep::GiveUp(ReconnectError::Cancelled);
        }
        self.phase = ReconnectPhase::Resuming;
        ReconnectStep::Resume
    }

    /// The previous step failed; decide the next one.
    pub fn next_step(&mut self) -> ReconnectStep {
        if self.cancel.is_cancelled() {
            self.phase = ReconnectPhase::Cancelled;
            return ReconnectStep::GiveUp(ReconnectError::Cancelled);
        }
        match self.state.next_delay() {
            Some(delay) => {
                let attempt = self.state.attempts();
                self.phase = ReconnectPhase::Waiting { attempt };
                ReconnectStep::Wait { attempt, delay }
            }
            None => {
                self.phase = ReconnectPhase::Exhausted;
                ReconnectStep::GiveUp(ReconnectError::MaxAttemptsExhausted)
            }
        }
    }

    /// Sleep `delay` unless cancelled first.
    pub async fn sleep(&mut self, delay: Duration) -> Result<(), ReconnectError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                self.phase = ReconnectPhase::Cancelled;
                return Err(ReconnectError::Cancelled);
            }
        }
        if let ReconnectPhase::Waiting { attempt } = self.phase {
            self.phase = ReconnectPhase::Attempting { attempt };
        }
        Ok(())
    }

    /// The current step succeeded.
    pub fn succeeded(&mut self) {
        self.phase = ReconnectPhase::Recovered;
        self.state.reset();
    }

    /// Current phase.
    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Attempts made in the current episode.
    pub fn attempts(&self) -> u32 {
        self.state.attempts()
    }

    /// Token that abandons this reconnector.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run one episode: resume first, then full attempts with backoff.
    ///
    /// `attempt` receives the 1-based attempt number and is responsible for
    /// tearing down the previous identity before retrying.
    pub async fn drive<T, E, R, RF, A, AF>(
        &mut self,
        mut resume: R,
        mut attempt: A,
    ) -> Result<T, ReconnectError>
    where
        E: Display,
        R: FnMut() -> RF,
        RF: Future<Output = Result<T, E>>,
        A: FnMut(u32) -> AF,
        AF: Future<Output = Result<T, E>>,
    {
        let cancel = self.cancel.clone();
        let mut step = self.begin();
        loop {
            match step {
                ReconnectStep::Resume => {
                    let result = tokio::select! {
                        result = resume() => result,
                        _ = cancel.cancelled() => {
                            self.phase = ReconnectPhase::Cancelled;
                            return Err(ReconnectError::Cancelled);
                        }
                    };
                    match result {
                        Ok(value) => {
                            tracing::info!("Resumed signaling in place");
                            self.succeeded();
                            return Ok(value);
                        }
                        Err(e) => tracing::warn!("In-place resume failed: {}", e),
                    }
                }
                ReconnectStep::Wait { attempt: n, delay } => {
                    tracing::info!("Reconnection attempt {} in {:?}", n, delay);
                    self.sleep(delay).await?;
                    let result = tokio::select! {
                        result = attempt(n) => result,
                        _ = cancel.cancelled() => {
                            self.phase = ReconnectPhase::Cancelled;
                            return Err(ReconnectError::Cancelled);
                        }
                    };
                    match result {
                        Ok(value) => {
                            tracing::info!("Reconnected after {} attempts", n);
                            self.succeeded();
                            return Ok(value);
                        }
                        Err(e) => tracing::warn!("Reconnection attempt {} failed: {}", n, e),
                    }
                }
                ReconnectStep::GiveUp(err) => return Err(err),
            }
            step = self.next_step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options() -> ReconnectOptions {
        ReconnectOptions {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_sequence_doubles_to_cap() {
        let mut state = ReconnectState::new(ReconnectOptions {
            max_attempts: 6,
            ..Default::default()
        });
        let delays: Vec<u64> = std::iter::from_fn(|| state.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_max_attempts_exhausted() {
        let mut state = ReconnectState::new(ReconnectOptions::default());
        assert!(state.next_delay().is_some()); // Attempt 1
        assert!(state.next_delay().is_some()); // Attempt 2
        assert!(state.next_delay().is_some()); // Attempt 3
        assert!(state.next_delay().is_none()); // Exhausted
        assert_eq!(state.attempts(), 3);
    }

    #[test]
    fn test_jittered_delays_non_decreasing_and_capped() {
        for _ in 0..50 {
            let mut state = ReconnectState::new(ReconnectOptions {
                jitter: 0.9,
                max_attempts: 10,
                ..Default::default()
            });
            let mut last = Duration::ZERO;
            while let Some(delay) = state.next_delay() {
                assert!(delay >= last, "{delay:?} < {last:?}");
                assert!(delay <= Duration::from_secs(10));
                last = delay;
            }
        }
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut state = ReconnectState::new(ReconnectOptions::default());
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_options_from_config() {
        let config = marionette_config::ReconnectConfig {
            initial_delay_ms: 250,
            max_attempts: 5,
            ..Default::default()
        };
        let options = ReconnectOptions::from(&config);
        assert_eq!(options.initial_delay, Duration::from_millis(250));
        assert_eq!(options.max_delay, Duration::from_secs(10));
        assert_eq!(options.max_attempts, 5);
    }

    #[test]
    fn test_state_machine_walks_resume_then_attempts_then_gives_up() {
        let mut reconnector = Reconnector::new(ReconnectOptions::default(), CancelToken::new());
        assert_eq!(reconnector.begin(), ReconnectStep::Resume);
        assert_eq!(reconnector.phase(), ReconnectPhase::Resuming);

        for n in 1..=3 {
            assert!(matches!(
                reconnector.next_step(),
                ReconnectStep::Wait { attempt, .. } if attempt == n
            ));
        }
        assert_eq!(
            reconnector.next_step(),
            ReconnectStep::GiveUp(ReconnectError::MaxAttemptsExhausted)
        );
        assert_eq!(reconnector.phase(), ReconnectPhase::Exhausted);
    }

    #[test]
    fn test_cancelled_token_stops_state_machine() {
        let token = CancelToken::new();
        let mut reconnector = Reconnector::new(ReconnectOptions::default(), token.clone());
        reconnector.begin();
        token.cancel();
        assert_eq!(
            reconnector.next_step(),
            ReconnectStep::GiveUp(ReconnectError::Cancelled)
        );
        assert_eq!(reconnector.phase(), ReconnectPhase::Cancelled);
    }

    #[tokio::test]
    async fn test_drive_resume_success_skips_attempts() {
        let mut reconnector = Reconnector::new(fast_options(), CancelToken::new());
        let attempts = AtomicU32::new(0);
        let result: Result<&str, ReconnectError> = reconnector
            .drive(
                || async { Ok::<_, String>("resumed") },
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>("attempted") }
                },
            )
            .await;
        assert_eq!(result, Ok("resumed"));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(reconnector.phase(), ReconnectPhase::Recovered);
    }

    #[tokio::test]
    async fn test_drive_succeeds_on_second_attempt() {
        let mut reconnector = Reconnector::new(fast_options(), CancelToken::new());
        let result = reconnector
            .drive(
                || async { Err::<u32, _>("expired") },
                |n| async move { if n == 2 { Ok(n) } else { Err("refused") } },
            )
            .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_drive_exhausts_after_max_attempts() {
        let mut reconnector = Reconnector::new(fast_options(), CancelToken::new());
        let attempts = AtomicU32::new(0);
        let result = reconnector
            .drive(
                || async { Err::<(), _>("expired") },
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("refused") }
                },
            )
            .await;
        assert_eq!(result, Err(ReconnectError::MaxAttemptsExhausted));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_abandons_immediately() {
        let token = CancelToken::new();
        let mut reconnector = Reconnector::new(
            ReconnectOptions {
                initial_delay: Duration::from_secs(60),
                ..Default::default()
            },
            token.clone(),
        );
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            reconnector.drive(
                || async { Err::<(), _>("expired") },
                |_| async { Ok(()) },
            ),
        )
        .await
        .expect("cancel should interrupt the 60s backoff");
        canceller.await.unwrap();

        assert_eq!(result, Err(ReconnectError::Cancelled));
        assert_eq!(reconnector.phase(), ReconnectPhase::Cancelled);
    }
}
