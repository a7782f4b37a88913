//! Data-channel transport contract.
//!
//! The signaling/transport substrate is supplied from outside. It hands out
//! ordered, reliable byte channels between two peers and reports the health
//! of the peer's signaling registration. Everything above this module only
//! talks to the [`Transport`] trait, so tests run over
//! [`MemoryNetwork`](crate::memory::MemoryNetwork).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};

use crate::peer::PeerId;

/// Something that happened on a channel, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A complete message from the remote side.
    Data(Vec<u8>),
    /// The remote side closed the channel.
    Closed,
    /// The channel failed; it is closed afterwards.
    Error(String),
}

/// Sending half of a channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Queue `bytes` for the remote side.
    ///
    /// Returns `false` if the channel is no longer open.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        self.is_open() && self.tx.send(ChannelEvent::Data(bytes)).is_ok()
    }

    /// Close the channel for both sides. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(ChannelEvent::Closed);
        }
    }

    /// Report a failure to the remote side and close the channel.
    pub fn fail(&self, reason: impl Into<String>) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(ChannelEvent::Error(reason.into()));
        }
    }

    /// Close the link as a network failure would: both ends see `Closed`.
    pub(crate) fn sever(&self, other: &ChannelHandle) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(ChannelEvent::Closed);
            let _ = other.tx.send(ChannelEvent::Closed);
        }
    }

    /// Whether the channel is still usable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }
}

/// One end of a bidirectional data channel.
#[derive(Debug)]
pub struct Channel {
    /// Peer on the other end.
    pub remote: PeerId,
    /// Sends to `remote`.
    pub handle: ChannelHandle,
    /// Events sent by `remote`. Yields `None` once the remote end is gone.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Create both ends of a channel between `a` and `b`.
    ///
    /// The first element is `a`'s end (its `remote` is `b`).
    pub fn pair(a: PeerId, b: PeerId) -> (Channel, Channel) {
        let open = Arc::new(AtomicBool::new(true));
        let (to_b, b_events) = mpsc::unbounded_channel();
        let (to_a, a_events) = mpsc::unbounded_channel();

        let a_end = Channel {
            remote: b.clone(),
            handle: ChannelHandle {
                tx: to_b,
                open: Arc::clone(&open),
            },
            events: a_events,
        };
        let b_end = Channel {
            remote: a,
            handle: ChannelHandle { tx: to_a, open },
            events: b_events,
        };
        (a_end, b_end)
    }
}

/// Health of a peer's registration with the signaling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Reachable; new channels can be opened and accepted.
    Connected,
    /// Registration lost. Open channels may survive but no new ones arrive.
    Lost,
}

/// Result of registering an identity with the transport.
#[derive(Debug)]
pub struct Registration {
    /// Channels opened by remote peers towards this identity.
    pub incoming: mpsc::Receiver<Channel>,
    /// Signaling health for this identity.
    pub signaling: watch::Receiver<SignalingState>,
}

/// Errors reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Another endpoint already holds this identity.
    #[error("peer id {0} is already taken")]
    IdTaken(PeerId),

    /// The remote peer is not registered (unknown or expired).
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),

    /// The identity is not (or no longer) registered.
    #[error("peer {0} is not registered")]
    NotRegistered(PeerId),

    /// Signaling or network failure.
    #[error("network error: {0}")]
    Network(String),
}

/// Signaling and data-channel substrate.
pub trait Transport: Send + Sync + 'static {
    /// Claim `id` and start accepting channels for it.
    fn register(
        &self,
        id: &PeerId,
    ) -> impl Future<Output = Result<Registration, TransportError>> + Send;

    /// Re-attach to an identity whose signaling was lost, keeping it.
    fn resume(
        &self,
        id: &PeerId,
    ) -> impl Future<Output = Result<Registration, TransportError>> + Send;

    /// Open a channel from `local` to `remote`.
    fn connect(
        &self,
        local: &PeerId,
        remote: &PeerId,
    ) -> impl Future<Output = Result<Channel, TransportError>> + Send;

    /// Release `id`. Open channels are not closed.
    fn unregister(&self, id: &PeerId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = Channel::pair(PeerId::from("a"), PeerId::from("b"));
        assert_eq!(a.remote, PeerId::from("b"));
        assert_eq!(b.remote, PeerId::from("a"));

        assert!(a.handle.send(vec![1]));
        assert!(a.handle.send(vec![2]));
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Data(vec![1])));
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Data(vec![2])));
    }

    #[tokio::test]
    async fn test_close_is_seen_by_remote_and_blocks_both_sides() {
        let (a, mut b) = Channel::pair(PeerId::from("a"), PeerId::from("b"));
        a.handle.close();
        a.handle.close();

        assert_eq!(b.events.recv().await, Some(ChannelEvent::Closed));
        assert!(!a.handle.is_open());
        assert!(!b.handle.is_open());
        assert!(!b.handle.send(vec![9]));
    }

    #[tokio::test]
    async fn test_dropping_an_end_closes_the_other() {
        let (a, mut b) = Channel::pair(PeerId::from("a"), PeerId::from("b"));
        drop(a);
        assert_eq!(b.events.recv().await, None);
        assert!(!b.handle.is_open());
    }
}
