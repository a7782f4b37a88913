//! Message routing: unicast/broadcast over open channels and observer
//! registries for decoded messages and connection changes.
//!
//! The [`MessageRouter`] owns the sending half of every open channel, keyed
//! by remote [`PeerId`]. Outbound messages are wrapped in an [`Envelope`]
//! carrying the local peer id and a wall-clock timestamp, encoded once, and
//! written to one or more channels. Inbound envelopes are handed to the
//! router's [`RouterObservers`] after session bookkeeping has run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::messages::{Envelope, Message, MessageTag, encode};
use crate::peer::{PeerId, unix_millis};
use crate::transport::ChannelHandle;

// ---------------------------------------------------------------------------
// Observer registry
// ---------------------------------------------------------------------------

struct Registry<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<T>)>,
}

/// A set of observers that can be notified from any thread.
///
/// Subscribing returns a [`Subscription`]; dropping it removes the observer.
pub struct Observers<T: ?Sized> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: ?Sized> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for Observers<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

fn lock<T: ?Sized>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T: ?Sized + Send + Sync + 'static> Observers<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. It stays registered until the subscription drops.
    pub fn subscribe(&self, observer: Arc<T>) -> Subscription {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, observer));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).entries.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Current observers, in subscription order.
    ///
    /// Notification iterates a snapshot so observers may subscribe or
    /// unsubscribe while being called.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer returned by [`Observers::subscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the observer now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the observer registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Router observers
// ---------------------------------------------------------------------------

/// Channel lifecycle and membership changes reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    /// A direct channel to the peer opened.
    Opened,
    /// The peer was announced (directly or relayed by the host).
    Joined {
        /// Announced display name.
        display_name: String,
    },
    /// The peer announced that it left.
    Left,
    /// The direct channel to the peer closed.
    Closed,
}

type MessageObserver = dyn Fn(&Envelope) + Send + Sync;
type ConnectionObserver = dyn Fn(&PeerId, &ConnectionChange) + Send + Sync;

/// Subscription points of a [`MessageRouter`]. Cheap to clone; clones share
/// the same registries.
#[derive(Clone, Default)]
pub struct RouterObservers {
    messages: Observers<MessageObserver>,
    connections: Observers<ConnectionObserver>,
}

impl RouterObservers {
    /// Observe every delivered message.
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.messages.subscribe(Arc::new(handler))
    }

    /// Observe delivered messages of one type.
    pub fn on_tag<F>(&self, tag: MessageTag, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.on_message(move |envelope: &Envelope| {
            if envelope.message.tag() == tag {
                handler(envelope);
            }
        })
    }

    /// Observe channel and membership changes.
    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PeerId, &ConnectionChange) + Send + Sync + 'static,
    {
        self.connections.subscribe(Arc::new(handler))
    }

    /// Hand an envelope to every message observer.
    pub fn deliver(&self, envelope: &Envelope) {
        for observer in self.messages.snapshot() {
            observer(envelope);
        }
    }

    /// Report a connection change to every connection observer.
    pub fn notify(&self, peer: &PeerId, change: &ConnectionChange) {
        for observer in self.connections.snapshot() {
            observer(peer, change);
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Sends messages over open channels and fans inbound messages out to
/// observers.
pub struct MessageRouter {
    local: PeerId,
    channels: HashMap<PeerId, ChannelHandle>,
    observers: RouterObservers,
}

impl MessageRouter {
    /// Create a router for the given local identity.
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            channels: HashMap::new(),
            observers: RouterObservers::default(),
        }
    }

    /// Local peer id stamped on outgoing envelopes.
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Register an open channel. Replaces (and closes) any previous channel
    /// to the same peer.
    pub fn attach(&mut self, peer: PeerId, handle: ChannelHandle) {
        if let Some(previous) = self.channels.insert(peer, handle) {
            previous.close();
        }
    }

    /// Forget the channel to `peer`, returning it if present.
    pub fn detach(&mut self, peer: &PeerId) -> Option<ChannelHandle> {
        self.channels.remove(peer)
    }

    /// Whether a channel to `peer` is registered.
    pub fn is_attached(&self, peer: &PeerId) -> bool {
        self.channels.contains_key(peer)
    }

    /// Peers with a registered channel, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.channels.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Wrap `message` in an envelope from the local peer, stamped now.
    pub fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(self.local.clone(), unix_millis(), message)
    }

    fn encode_or_warn(envelope: &Envelope) -> Option<Vec<u8>> {
        match encode(envelope) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed to encode {} message: {}", envelope.message.kind(), e);
                None
            }
        }
    }

    /// Send a local message to one peer. Returns `false` if no open channel.
    pub fn send(&self, peer: &PeerId, message: Message) -> bool {
        let envelope = self.envelope(message);
        self.send_envelope(peer, &envelope)
    }

    /// Send an already-addressed envelope (e.g. a relay) to one peer.
    pub fn send_envelope(&self, peer: &PeerId, envelope: &Envelope) -> bool {
        let Some(handle) = self.channels.get(peer) else {
            return false;
        };
        match Self::encode_or_warn(envelope) {
            Some(bytes) => handle.send(bytes),
            None => false,
        }
    }

    /// Send a local message to every connected peer. Returns the number of
    /// channels that accepted it.
    pub fn broadcast(&self, message: Message) -> usize {
        let envelope = self.envelope(message);
        self.broadcast_envelope(&envelope, None)
    }

    /// Send a local message to every connected peer except `except`.
    pub fn broadcast_except(&self, except: &PeerId, message: Message) -> usize {
        let envelope = self.envelope(message);
        self.broadcast_envelope(&envelope, Some(except))
    }

    /// Send an envelope to every connected peer, optionally skipping one.
    ///
    /// The envelope is encoded once for all recipients.
    pub fn broadcast_envelope(&self, envelope: &Envelope, except: Option<&PeerId>) -> usize {
        let Some(bytes) = Self::encode_or_warn(envelope) else {
            return 0;
        };
        self.channels
            .iter()
            .filter(|(peer, _)| Some(*peer) != except)
            .filter(|(_, handle)| handle.send(bytes.clone()))
            .count()
    }

    /// Close and forget every channel.
    pub fn close_all(&mut self) {
        for (_, handle) in self.channels.drain() {
            handle.close();
        }
    }

    /// Shared subscription points.
    pub fn observers(&self) -> RouterObservers {
        self.observers.clone()
    }

    /// See [`RouterObservers::on_message`].
    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.observers.on_message(handler)
    }

    /// See [`RouterObservers::on_tag`].
    pub fn on_tag<F>(&self, tag: MessageTag, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.observers.on_tag(tag, handler)
    }

    /// See [`RouterObservers::on_connection_change`].
    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PeerId, &ConnectionChange) + Send + Sync + 'static,
    {
        self.observers.on_connection_change(handler)
    }

    /// Forward a decoded inbound envelope to message observers.
    pub fn deliver(&self, envelope: &Envelope) {
        self.observers.deliver(envelope);
    }

    /// Forward a connection change to connection observers.
    pub fn notify(&self, peer: &PeerId, change: ConnectionChange) {
        self.observers.notify(peer, &change);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
