//! Peer networking: wire protocol, transport contract, message routing,
//! heartbeat diagnostics, reconnection policy, and connection management.

pub mod connection;
pub mod diagnostics;
pub mod memory;
pub mod messages;
pub mod peer;
pub mod reconnection;
pub mod routing;
pub mod transport;

pub use connection::{
    Admission, Bookkeeping, ConnectionManager, ConnectionOptions, PeerConnectionState, PeerRecord,
    Role, SessionInfo, SessionStatus, StateError, StatusWatch,
};
pub use diagnostics::{LatencySnapshot, LatencyTracker};
pub use memory::MemoryNetwork;
pub use messages::{
    AssetKind, AssetRequest, AvatarState, BoneTransform, Chat, Chunk, ChunkRequest, Envelope,
    ExpressionUpdate, Message, MessageError, MessageTag, PeerJoined, PeerLeft, Ping, Pong,
    PoseUpdate, Reaction, SceneSettings, SyncResponse, TransferComplete, decode, encode,
};
pub use peer::{PeerId, RoomId, unix_millis};
pub use reconnection::{
    CancelToken, ReconnectError, ReconnectOptions, ReconnectPhase, ReconnectState, ReconnectStep,
    Reconnector,
};
pub use routing::{ConnectionChange, MessageRouter, Observers, RouterObservers, Subscription};
pub use transport::{
    Channel, ChannelEvent, ChannelHandle, Registration, SignalingState, Transport, TransportError,
};
