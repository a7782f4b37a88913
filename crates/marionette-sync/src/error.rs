//! Error types surfaced by sessions and transfers.

use std::time::Duration;

use marionette_net::{AssetKind, PeerId, RoomId, StateError, TransportError};

/// Creating a session (hosting) failed. The session is torn down.
#[derive(Debug, thiserror::Error)]
pub enum SessionCreateError {
    /// The generated room id is already registered.
    #[error("room id {0} is already taken")]
    IdCollision(PeerId),
    /// Signaling or network failure.
    #[error("network error: {0}")]
    Network(TransportError),
    /// Registration did not complete within the connect timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A session is already active on this manager.
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<TransportError> for SessionCreateError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::IdTaken(id) => SessionCreateError::IdCollision(id),
            other => SessionCreateError::Network(other),
        }
    }
}

/// Joining a session failed. The session is torn down.
#[derive(Debug, thiserror::Error)]
pub enum SessionJoinError {
    /// No host is registered under this room id (never existed or expired).
    #[error("room {0} not found")]
    RoomNotFound(RoomId),
    /// The host did not answer within the connect timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The host closed the channel without admitting us (e.g. room full).
    #[error("rejected by host: {0}")]
    Rejected(String),
    /// Signaling or network failure.
    #[error("network error: {0}")]
    Network(TransportError),
    /// A session is already active on this manager.
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<TransportError> for SessionJoinError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PeerUnavailable(room) => SessionJoinError::RoomNotFound(room),
            other => SessionJoinError::Network(other),
        }
    }
}

/// Failure of a single asset transfer. Never affects the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// The same asset is already being sent to this peer.
    #[error("{asset:?} transfer to {peer} already in flight")]
    AlreadyInFlight {
        /// Receiver.
        peer: PeerId,
        /// Asset class.
        asset: AssetKind,
    },
    /// Nothing to send.
    #[error("asset is empty")]
    EmptyAsset,
    /// The asset needs more chunks than a receiver will buffer.
    #[error("asset needs {chunks} chunks, limit is {limit}")]
    TooLarge {
        /// Chunks the asset splits into.
        chunks: usize,
        /// Configured `max_chunks`.
        limit: usize,
    },
    /// Chunks still missing after every retry round.
    #[error("{missing} chunks still missing after {rounds} request rounds")]
    MissingChunks {
        /// Chunks never received.
        missing: usize,
        /// Request rounds issued.
        rounds: u32,
    },
    /// Reassembled size differs from the announced size.
    #[error("reassembled {actual} bytes, sender announced {expected}")]
    SizeMismatch {
        /// Size from `transfer-complete`.
        expected: u64,
        /// Size after reassembly.
        actual: u64,
    },
    /// A message referred to a transfer that does not exist.
    #[error("no {asset:?} transfer with {peer}")]
    UnknownTransfer {
        /// Remote peer.
        peer: PeerId,
        /// Asset class.
        asset: AssetKind,
    },
}

/// The renderer could not load a reassembled asset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RendererError {
    /// The bytes were not a loadable asset.
    #[error("asset rejected: {0}")]
    Rejected(String),
}

/// The session task has stopped; the handle can no longer reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session has ended")]
pub struct SessionEnded;

/// An explicit asset push through a session handle failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetSendError {
    /// The transfer engine refused the send.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// The session is gone.
    #[error(transparent)]
    Ended(#[from] SessionEnded),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_to_create_errors() {
        let err = SessionCreateError::from(TransportError::IdTaken(PeerId::from("room-1")));
        assert!(matches!(err, SessionCreateError::IdCollision(id) if id.as_str() == "room-1"));

        let err = SessionCreateError::from(TransportError::Network("down".into()));
        assert!(matches!(err, SessionCreateError::Network(_)));
    }

    #[test]
    fn test_unavailable_room_maps_to_not_found() {
        let err = SessionJoinError::from(TransportError::PeerUnavailable(PeerId::from("r")));
        assert_eq!(err.to_string(), "room r not found");
    }
}
