//! In-process network linking several adapters together.
//!
//! Each joined node gets a `LoopbackTransport` and an event receiver for
//! `Adapter::attach`. Links are bidirectional and announce themselves with
//! `Connected`/`Disconnected` events on both ends. A muted node accepts frames
//! but never sees them, which is how tests model an unresponsive peer.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Transport, TransportError, TransportEvent};
use crate::domain::NodeId;

#[derive(Default)]
pub struct LoopbackNetwork {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<TransportEvent>>>,
    links: RwLock<HashSet<(NodeId, NodeId)>>,
    muted: RwLock<HashSet<NodeId>>,
}

fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `node` and returns its transport plus the event stream to attach.
    pub fn join(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(node.clone(), tx);
        debug!(node = %node, "Joined loopback network");
        let transport = Arc::new(LoopbackTransport {
            local: node,
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    pub fn link(&self, a: &NodeId, b: &NodeId) {
        if self.links.write().insert(link_key(a, b)) {
            self.notify(a, TransportEvent::Connected(b.clone()));
            self.notify(b, TransportEvent::Connected(a.clone()));
        }
    }

    pub fn unlink(&self, a: &NodeId, b: &NodeId) {
        if self.links.write().remove(&link_key(a, b)) {
            self.notify(a, TransportEvent::Disconnected(b.clone()));
            self.notify(b, TransportEvent::Disconnected(a.clone()));
        }
    }

    pub fn is_linked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.links.read().contains(&link_key(a, b))
    }

    /// Frames addressed to `node` are accepted and silently dropped.
    pub fn mute(&self, node: &NodeId) {
        self.muted.write().insert(node.clone());
    }

    pub fn unmute(&self, node: &NodeId) {
        self.muted.write().remove(node);
    }

    fn notify(&self, node: &NodeId, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.read().get(node) {
            let _ = inbox.send(event);
        }
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_linked(from, to) {
            return Err(TransportError::NotConnected(to.clone()));
        }
        if self.muted.read().contains(to) {
            trace!(from = %from, to = %to, "Dropping frame for muted node");
            return Ok(());
        }
        let inboxes = self.inboxes.read();
        let inbox = inboxes
            .get(to)
            .ok_or_else(|| TransportError::NotConnected(to.clone()))?;
        inbox
            .send(TransportEvent::Frame {
                from: from.clone(),
                bytes,
            })
            .map_err(|_| TransportError::Closed(to.clone()))
    }
}

pub struct LoopbackTransport {
    local: NodeId,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn local(&self) -> &NodeId {
        &self.local
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, next_hop: &NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.network.deliver(&self.local, next_hop, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: &str) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_link_announces_both_ends() {
        let network = LoopbackNetwork::new();
        let (_a, mut a_rx) = network.join(node("A"));
        let (_b, mut b_rx) = network.join(node("B"));

        network.link(&node("A"), &node("B"));
        assert_eq!(a_rx.recv().await, Some(TransportEvent::Connected(node("B"))));
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Connected(node("A"))));

        // Linking twice is a no-op.
        network.link(&node("B"), &node("A"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_link() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = network.join(node("A"));
        let (_b, mut b_rx) = network.join(node("B"));

        let err = a.send(&node("B"), b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));

        network.link(&node("A"), &node("B"));
        a.send(&node("B"), b"x".to_vec()).await.unwrap();
        assert_eq!(b_rx.recv().await, Some(TransportEvent::Connected(node("A"))));
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Frame {
                from: node("A"),
                bytes: b"x".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_muted_node_swallows_frames() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = network.join(node("A"));
        let (_b, mut b_rx) = network.join(node("B"));
        network.link(&node("A"), &node("B"));
        let _ = b_rx.recv().await;

        network.mute(&node("B"));
        a.send(&node("B"), b"x".to_vec()).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unlink_announces_disconnect() {
        let network = LoopbackNetwork::new();
        let (_a, mut a_rx) = network.join(node("A"));
        let (_b, _b_rx) = network.join(node("B"));
        network.link(&node("A"), &node("B"));
        let _ = a_rx.recv().await;

        network.unlink(&node("A"), &node("B"));
        assert_eq!(a_rx.recv().await, Some(TransportEvent::Disconnected(node("B"))));
        assert!(!network.is_linked(&node("A"), &node("B")));
    }
}
