//! Wire protocol: message types and serialization.
//!
//! Every message travels as a versioned frame:
//!
//! ```text
//! +----------------+-------------------------------------------------+
//! | version (u8)   | postcard(WireFrame { kind, sender, ts, payload })|
//! +----------------+-------------------------------------------------+
//! ```
//!
//! `kind` is the kebab-case message type and `payload` is the postcard
//! encoding of that type's body. Receivers that do not recognise `kind`
//! decode it as [`Message::Unknown`] instead of failing, so newer peers can
//! add message types without breaking older ones.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Shared state types
// ---------------------------------------------------------------------------

/// Class of binary asset moved by the chunked transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    /// The participant's avatar model.
    Avatar,
    /// The host's scene background.
    Background,
}

/// Rotation (and optional translation) of a single bone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoneTransform {
    /// Local rotation.
    pub rotation: Quat,
    /// Local translation, only sent for bones that move (e.g. hips).
    pub position: Option<Vec3>,
}

impl BoneTransform {
    /// A rotation-only bone transform.
    pub fn rotation(rotation: Quat) -> Self {
        Self {
            rotation,
            position: None,
        }
    }
}

/// Synchronized snapshot of one peer's avatar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    /// Owner of this avatar.
    pub peer_id: PeerId,
    /// Owner's display name.
    pub display_name: String,
    /// Root rotation as Euler angles (radians).
    pub root_rotation: Vec3,
    /// Bone name → transform.
    pub pose: BTreeMap<String, BoneTransform>,
    /// Blend shape name → weight in `[0, 1]`.
    pub expressions: BTreeMap<String, f32>,
    /// Root position in scene units.
    pub position: Vec3,
    /// Whether the owner has an avatar asset loaded.
    pub has_asset: bool,
    /// Owner's clock when the snapshot was sampled.
    pub timestamp_ms: u64,
}

/// Host-owned scene settings shared on reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSettings {
    /// Clear color behind the avatars (linear RGB).
    pub background_color: [f32; 3],
    /// Whether the host holds a background asset guests should fetch.
    pub has_background: bool,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            background_color: [0.1, 0.1, 0.12],
            has_background: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Announcement that a peer is present in the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerJoined {
    /// The announced peer (may differ from the sender when relayed).
    pub peer_id: PeerId,
    /// Its display name.
    pub display_name: String,
}

/// Announcement that a peer left the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLeft {
    /// The departing peer.
    pub peer_id: PeerId,
}

/// Heartbeat ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    /// Sender clock in milliseconds.
    pub sent_at: u64,
}

/// Heartbeat reply echoing the ping's timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    /// Echoed [`Ping::sent_at`].
    pub sent_at: u64,
    /// Responder clock when the ping arrived.
    pub received_at: u64,
}

/// Full reconciliation answer to a `sync-request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Every avatar the responder knows about, its own included.
    pub avatar_states: Vec<AvatarState>,
    /// Scene settings, sent by the host only.
    pub scene_settings: Option<SceneSettings>,
}

/// Partial pose update; absent fields keep their previous values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseUpdate {
    /// Bones that changed.
    pub pose: BTreeMap<String, BoneTransform>,
    /// New root rotation, if sampled.
    pub root_rotation: Option<Vec3>,
    /// New root position, if sampled.
    pub position: Option<Vec3>,
}

/// Blend shape weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionUpdate {
    /// Blend shape name → weight.
    pub expressions: BTreeMap<String, f32>,
}

/// Request for `target`'s asset of class `asset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    /// Owner of the requested asset.
    pub target: PeerId,
    /// Which asset.
    pub asset: AssetKind,
}

/// One fragment of an asset transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Receiver of the transfer.
    pub target: PeerId,
    /// Asset class being transferred.
    pub asset: AssetKind,
    /// Zero-based chunk index.
    pub index: u32,
    /// Number of chunks in the whole transfer.
    pub total_chunks: u32,
    /// Chunk payload.
    pub bytes: Vec<u8>,
}

/// Sent after the last chunk of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferComplete {
    /// Receiver of the transfer.
    pub target: PeerId,
    /// Asset class being transferred.
    pub asset: AssetKind,
    /// Size of the whole asset in bytes.
    pub file_size: u64,
}

/// Receiver asks the sender to resend one missing chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    /// Original sender of the transfer.
    pub target: PeerId,
    /// Asset class being transferred.
    pub asset: AssetKind,
    /// Missing chunk index.
    pub index: u32,
}

/// Text chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    /// Message text.
    pub text: String,
}

/// Emoji reaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    /// Emoji or reaction name.
    pub emoji: String,
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Every message type of the session protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `peer-joined`
    PeerJoined(PeerJoined),
    /// `peer-left`
    PeerLeft(PeerLeft),
    /// `ping`
    Ping(Ping),
    /// `pong`
    Pong(Pong),
    /// `sync-request`
    SyncRequest,
    /// `sync-response`
    SyncResponse(SyncResponse),
    /// `avatar-state`: full replacement of one avatar.
    AvatarState(Box<AvatarState>),
    /// `pose-update`
    PoseUpdate(PoseUpdate),
    /// `expression-update`
    ExpressionUpdate(ExpressionUpdate),
    /// `asset-request`
    AssetRequest(AssetRequest),
    /// `chunk`
    Chunk(Chunk),
    /// `transfer-complete`
    TransferComplete(TransferComplete),
    /// `chunk-request`
    ChunkRequest(ChunkRequest),
    /// `chat`
    Chat(Chat),
    /// `reaction`
    Reaction(Reaction),
    /// A message type this build does not know. Never sent.
    Unknown {
        /// The unrecognised `kind` string.
        kind: String,
    },
}

/// Fieldless discriminant of [`Message`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    /// `peer-joined`
    PeerJoined,
    /// `peer-left`
    PeerLeft,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `sync-request`
    SyncRequest,
    /// `sync-response`
    SyncResponse,
    /// `avatar-state`
    AvatarState,
    /// `pose-update`
    PoseUpdate,
    /// `expression-update`
    ExpressionUpdate,
    /// `asset-request`
    AssetRequest,
    /// `chunk`
    Chunk,
    /// `transfer-complete`
    TransferComplete,
    /// `chunk-request`
    ChunkRequest,
    /// `chat`
    Chat,
    /// `reaction`
    Reaction,
    /// Unrecognised message type.
    Unknown,
}

const KNOWN_TAGS: [MessageTag; 15] = [
    MessageTag::PeerJoined,
    MessageTag::PeerLeft,
    MessageTag::Ping,
    MessageTag::Pong,
    MessageTag::SyncRequest,
    MessageTag::SyncResponse,
    MessageTag::AvatarState,
    MessageTag::PoseUpdate,
    MessageTag::ExpressionUpdate,
    MessageTag::AssetRequest,
    MessageTag::Chunk,
    MessageTag::TransferComplete,
    MessageTag::ChunkRequest,
    MessageTag::Chat,
    MessageTag::Reaction,
];

impl MessageTag {
    /// Wire name of this message type.
    pub fn kind(self) -> &'static str {
        match self {
            MessageTag::PeerJoined => "peer-joined",
            MessageTag::PeerLeft => "peer-left",
            MessageTag::Ping => "ping",
            MessageTag::Pong => "pong",
            MessageTag::SyncRequest => "sync-request",
            MessageTag::SyncResponse => "sync-response",
            MessageTag::AvatarState => "avatar-state",
            MessageTag::PoseUpdate => "pose-update",
            MessageTag::ExpressionUpdate => "expression-update",
            MessageTag::AssetRequest => "asset-request",
            MessageTag::Chunk => "chunk",
            MessageTag::TransferComplete => "transfer-complete",
            MessageTag::ChunkRequest => "chunk-request",
            MessageTag::Chat => "chat",
            MessageTag::Reaction => "reaction",
            MessageTag::Unknown => "unknown",
        }
    }

    /// Look up a known tag by wire name.
    pub fn from_kind(kind: &str) -> Option<Self> {
        KNOWN_TAGS.into_iter().find(|tag| tag.kind() == kind)
    }
}

impl Message {
    /// Extract the routing tag from a message without consuming it.
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::PeerJoined(_) => MessageTag::PeerJoined,
            Message::PeerLeft(_) => MessageTag::PeerLeft,
            Message::Ping(_) => MessageTag::Ping,
            Message::Pong(_) => MessageTag::Pong,
            Message::SyncRequest => MessageTag::SyncRequest,
            Message::SyncResponse(_) => MessageTag::SyncResponse,
            Message::AvatarState(_) => MessageTag::AvatarState,
            Message::PoseUpdate(_) => MessageTag::PoseUpdate,
            Message::ExpressionUpdate(_) => MessageTag::ExpressionUpdate,
            Message::AssetRequest(_) => MessageTag::AssetRequest,
            Message::Chunk(_) => MessageTag::Chunk,
            Message::TransferComplete(_) => MessageTag::TransferComplete,
            Message::ChunkRequest(_) => MessageTag::ChunkRequest,
            Message::Chat(_) => MessageTag::Chat,
            Message::Reaction(_) => MessageTag::Reaction,
            Message::Unknown { .. } => MessageTag::Unknown,
        }
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &str {
        match self {
            Message::Unknown { kind } => kind,
            other => other.tag().kind(),
        }
    }

    /// Addressee for point-to-point messages (asset traffic).
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Message::AssetRequest(m) => Some(&m.target),
            Message::Chunk(m) => Some(&m.target),
            Message::TransferComplete(m) => Some(&m.target),
            Message::ChunkRequest(m) => Some(&m.target),
            _ => None,
        }
    }

    /// Whether a host re-broadcasts this message to the other guests.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Message::AvatarState(_)
                | Message::PoseUpdate(_)
                | Message::ExpressionUpdate(_)
                | Message::Chat(_)
                | Message::Reaction(_)
        )
    }
}

/// A message plus the header fields every message shares.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Peer that authored the message (preserved across relays).
    pub sender: PeerId,
    /// Author's clock when the message was created.
    pub timestamp_ms: u64,
    /// The message itself.
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with its header.
    pub fn new(sender: PeerId, timestamp_ms: u64, message: Message) -> Self {
        Self {
            sender,
            timestamp_ms,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload: no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// [`Message::Unknown`] cannot be encoded.
    #[error("cannot encode unknown message kind {0:?}")]
    UnknownKind(String),

    /// Postcard serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct WireFrame {
    kind: String,
    sender: PeerId,
    timestamp_ms: u64,
    payload: Vec<u8>,
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}

/// Serialize an [`Envelope`] into a versioned binary frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, MessageError> {
    let payload = match &envelope.message {
        Message::PeerJoined(m) => body(m)?,
        Message::PeerLeft(m) => body(m)?,
        Message::Ping(m) => body(m)?,
        Message::Pong(m) => body(m)?,
        Message::SyncRequest => Vec::new(),
        Message::SyncResponse(m) => body(m)?,
        Message::AvatarState(m) => body(m.as_ref())?,
        Message::PoseUpdate(m) => body(m)?,
        Message::ExpressionUpdate(m) => body(m)?,
        Message::AssetRequest(m) => body(m)?,
        Message::Chunk(m) => body(m)?,
        Message::TransferComplete(m) => body(m)?,
        Message::ChunkRequest(m) => body(m)?,
        Message::Chat(m) => body(m)?,
        Message::Reaction(m) => body(m)?,
        Message::Unknown { kind } => return Err(MessageError::UnknownKind(kind.clone())),
    };

    let frame = WireFrame {
        kind: envelope.message.kind().to_string(),
        sender: envelope.sender.clone(),
        timestamp_ms: envelope.timestamp_ms,
        payload,
    };
    let encoded = postcard::to_allocvec(&frame)?;
    let mut out = Vec::with_capacity(1 + encoded.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Deserialize a versioned binary frame into an [`Envelope`].
///
/// Unrecognised kinds decode to [`Message::Unknown`]; malformed frames or
/// bodies are errors.
pub fn decode(data: &[u8]) -> Result<Envelope, MessageError> {
    let (&version, rest) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }

    let frame: WireFrame = postcard::from_bytes(rest)?;
    let p = frame.payload.as_slice();
    let message = match MessageTag::from_kind(&frame.kind) {
        Some(MessageTag::PeerJoined) => Message::PeerJoined(postcard::from_bytes(p)?),
        Some(MessageTag::PeerLeft) => Message::PeerLeft(postcard::from_bytes(p)?),
        Some(MessageTag::Ping) => Message::Ping(postcard::from_bytes(p)?),
        Some(MessageTag::Pong) => Message::Pong(postcard::from_bytes(p)?),
        Some(MessageTag::SyncRequest) => Message::SyncRequest,
        Some(MessageTag::SyncResponse) => Message::SyncResponse(postcard::from_bytes(p)?),
        Some(MessageTag::AvatarState) => Message::AvatarState(Box::new(postcard::from_bytes(p)?)),
        Some(MessageTag::PoseUpdate) => Message::PoseUpdate(postcard::from_bytes(p)?),
        Some(MessageTag::ExpressionUpdate) => Message::ExpressionUpdate(postcard::from_bytes(p)?),
        Some(MessageTag::AssetRequest) => Message::AssetRequest(postcard::from_bytes(p)?),
        Some(MessageTag::Chunk) => Message::Chunk(postcard::from_bytes(p)?),
        Some(MessageTag::TransferComplete) => Message::TransferComplete(postcard::from_bytes(p)?),
        Some(MessageTag::ChunkRequest) => Message::ChunkRequest(postcard::from_bytes(p)?),
        Some(MessageTag::Chat) => Message::Chat(postcard::from_bytes(p)?),
        Some(MessageTag::Reaction) => Message::Reaction(postcard::from_bytes(p)?),
        Some(MessageTag::Unknown) | None => Message::Unknown { kind: frame.kind },
    };

    Ok(Envelope {
        sender: frame.sender,
        timestamp_ms: frame.timestamp_ms,
        message,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
