//! Avatar state sync, chunked asset transfer and remote smoothing on top of
//! `marionette-net`.
//!
//! [`Session`] is the synchronous aggregate that owns one session's state.
//! [`SessionRuntime`] drives it over a [`marionette_net::Transport`] from a
//! single async task and hands back a [`SessionHandle`].

pub mod avatar;
pub mod error;
pub mod filter;
pub mod runtime;
pub mod session;
pub mod state_sync;
pub mod transfer;

pub use avatar::{ApplyOutcome, AvatarStore, merge_expressions, merge_pose};
pub use error::{
    AssetSendError, RendererError, SessionCreateError, SessionEnded, SessionJoinError,
    TransferError,
};
pub use filter::{
    AdaptiveFilter, ClockOffset, FilterOptions, InterpolationBuffer, RemoteStateFilter, Signal,
    SmoothedChannel,
};
pub use runtime::{ProgressObserver, Renderer, SessionHandle, SessionRuntime};
pub use session::{Session, SessionEvent, SessionOptions};
pub use state_sync::{RateLimiter, StateSyncEngine, SyncEffects, SyncOptions};
pub use transfer::{
    Direction, FailedTransfer, OutgoingMessage, ReassembledAsset, TransferBuffer, TransferEngine,
    TransferOptions, TransferOutput, TransferProgress, TransferStatus,
};
