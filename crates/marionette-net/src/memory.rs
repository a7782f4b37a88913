//! In-process [`Transport`] used by tests and the loopback demo.
//!
//! Every registered identity gets an incoming-channel queue and a signaling
//! watch. Test hooks simulate signaling loss, identity expiry, broken links
//! and a network outage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};

use crate::peer::PeerId;
use crate::transport::{
    Channel, ChannelHandle, Registration, SignalingState, Transport, TransportError,
};

/// Capacity of each endpoint's incoming-channel queue.
const INCOMING_CAPACITY: usize = 32;

struct Endpoint {
    incoming: mpsc::Sender<Channel>,
    signaling: watch::Sender<SignalingState>,
}

/// Both ends of one opened channel, kept so a test can break it.
struct Link {
    from: PeerId,
    to: PeerId,
    from_end: ChannelHandle,
    to_end: ChannelHandle,
}

impl Link {
    fn joins(&self, a: &PeerId, b: &PeerId) -> bool {
        (&self.from == a && &self.to == b) || (&self.from == b && &self.to == a)
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, Endpoint>,
    links: Vec<Link>,
    offline: bool,
}

/// Shared in-memory signaling service. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // A poisoned lock only means a test panicked mid-call; the map is
        // still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(state: &mut NetworkState, id: &PeerId) -> Registration {
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_CAPACITY);
        let (signaling_tx, signaling) = watch::channel(SignalingState::Connected);
        state.endpoints.insert(
            id.clone(),
            Endpoint {
                incoming: incoming_tx,
                signaling: signaling_tx,
            },
        );
        Registration {
            incoming,
            signaling,
        }
    }

    /// Whether `id` currently holds a registration.
    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.lock().endpoints.contains_key(id)
    }

    /// Mark `id`'s signaling as lost while keeping the identity resumable.
    pub fn drop_signaling(&self, id: &PeerId) {
        if let Some(endpoint) = self.lock().endpoints.get(id) {
            endpoint.signaling.send_replace(SignalingState::Lost);
        }
    }

    /// Drop `id`'s registration entirely so it cannot be resumed.
    pub fn expire(&self, id: &PeerId) {
        if let Some(endpoint) = self.lock().endpoints.remove(id) {
            endpoint.signaling.send_replace(SignalingState::Lost);
        }
    }

    /// Break every open channel between `a` and `b`. Both sides see it close.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.lock();
        state.links.retain(|link| {
            if link.joins(a, b) {
                link.from_end.sever(&link.to_end);
                return false;
            }
            link.from_end.is_open()
        });
    }

    /// While offline every register/resume/connect fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }
}

impl Transport for MemoryNetwork {
    async fn register(&self, id: &PeerId) -> Result<Registration, TransportError> {
        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Network("signaling server unreachable".into()));
        }
        if let Some(existing) = state.endpoints.get(id) {
            if !existing.incoming.is_closed() {
                return Err(TransportError::IdTaken(id.clone()));
            }
        }
        Ok(Self::attach(&mut state, id))
    }

    async fn resume(&self, id: &PeerId) -> Result<Registration, TransportError> {
        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Network("signaling server unreachable".into()));
        }
        if !state.endpoints.contains_key(id) {
            return Err(TransportError::NotRegistered(id.clone()));
        }
        Ok(Self::attach(&mut state, id))
    }

    async fn connect(&self, local: &PeerId, remote: &PeerId) -> Result<Channel, TransportError> {
        let mut state = self.lock();
        if state.offline {
            return Err(TransportError::Network("signaling server unreachable".into()));
        }
        if !state.endpoints.contains_key(local) {
            return Err(TransportError::NotRegistered(local.clone()));
        }
        let endpoint = state
            .endpoints
            .get(remote)
            .ok_or_else(|| TransportError::PeerUnavailable(remote.clone()))?;

        let (ours, theirs) = Channel::pair(local.clone(), remote.clone());
        let to_end = theirs.handle.clone();
        match endpoint.incoming.try_send(theirs) {
            Ok(()) => {
                state.links.retain(|link| link.from_end.is_open());
                state.links.push(Link {
                    from: local.clone(),
                    to: remote.clone(),
                    from_end: ours.handle.clone(),
                    to_end,
                });
                Ok(ours)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::Network(format!("{remote} is not accepting channels")))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::PeerUnavailable(remote.clone()))
            }
        }
    }

    fn unregister(&self, id: &PeerId) {
        if let Some(endpoint) = self.lock().endpoints.remove(id) {
            endpoint.signaling.send_replace(SignalingState::Lost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelEvent;

    #[tokio::test]
    async fn test_connect_delivers_channel_to_listener() {
        let net = MemoryNetwork::new();
        let host = PeerId::from("host");
        let guest = PeerId::from("guest");
        let mut host_reg = net.register(&host).await.unwrap();
        let _guest_reg = net.register(&guest).await.unwrap();

        let ours = net.connect(&guest, &host).await.unwrap();
        let mut theirs = host_reg.incoming.recv().await.unwrap();
        assert_eq!(theirs.remote, guest);

        assert!(ours.handle.send(b"hello".to_vec()));
        assert_eq!(
            theirs.events.recv().await,
            Some(ChannelEvent::Data(b"hello".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let net = MemoryNetwork::new();
        let id = PeerId::from("host");
        let _reg = net.register(&id).await.unwrap();
        assert_eq!(
            net.register(&id).await.unwrap_err(),
            TransportError::IdTaken(id.clone())
        );
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_fails() {
        let net = MemoryNetwork::new();
        let guest = PeerId::from("guest");
        let _reg = net.register(&guest).await.unwrap();
        let err = net.connect(&guest, &PeerId::from("nobody")).await.unwrap_err();
        assert_eq!(err, TransportError::PeerUnavailable(PeerId::from("nobody")));
    }

    #[tokio::test]
    async fn test_resume_after_signaling_loss_but_not_after_expiry() {
        let net = MemoryNetwork::new();
        let id = PeerId::from("host");
        let reg = net.register(&id).await.unwrap();

        net.drop_signaling(&id);
        assert_eq!(*reg.signaling.borrow(), SignalingState::Lost);
        let resumed = net.resume(&id).await.unwrap();
        assert_eq!(*resumed.signaling.borrow(), SignalingState::Connected);

        net.expire(&id);
        assert!(!net.is_registered(&id));
        assert!(matches!(
            net.resume(&id).await,
            Err(TransportError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_sever_closes_both_ends() {
        let net = MemoryNetwork::new();
        let host = PeerId::from("host");
        let guest = PeerId::from("guest");
        let mut host_reg = net.register(&host).await.unwrap();
        let _guest_reg = net.register(&guest).await.unwrap();
        let mut ours = net.connect(&guest, &host).await.unwrap();
        let mut theirs = host_reg.incoming.recv().await.unwrap();

        net.sever(&host, &guest);
        assert_eq!(ours.events.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(theirs.events.recv().await, Some(ChannelEvent::Closed));
        assert!(!ours.handle.send(b"late".to_vec()));
        assert!(!theirs.handle.is_open());
    }

    #[tokio::test]
    async fn test_offline_network_fails_registration() {
        let net = MemoryNetwork::new();
        net.set_offline(true);
        assert!(matches!(
            net.register(&PeerId::from("a")).await,
            Err(TransportError::Network(_))
        ));
        net.set_offline(false);
        assert!(net.register(&PeerId::from("a")).await.is_ok());
    }
}
