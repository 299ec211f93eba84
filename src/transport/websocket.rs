//! OCPP-J over WebSocket.
//!
//! A node dials a neighbour at `<url>/<local node id>`, the way charging
//! stations connect to a CSMS, and accepts inbound connections whose peer id is
//! the last segment of the request path. Every connection is full duplex and
//! feeds the same `TransportEvent` stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Transport, TransportError, TransportEvent};
use crate::domain::NodeId;

pub struct WebSocketTransport {
    local: NodeId,
    peers: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebSocketTransport {
    pub fn new(local: NodeId) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local,
            peers: RwLock::new(HashMap::new()),
            events,
        });
        (transport, rx)
    }

    /// Dials `peer` at `url`. The local node id is appended as the last path segment.
    pub async fn connect(self: &Arc<Self>, url: &str, peer: NodeId) -> Result<(), TransportError> {
        let endpoint = format!("{}/{}", url.trim_end_matches('/'), self.local);
        let (stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Io(format!("connect to {}: {}", endpoint, e)))?;
        info!(peer = %peer, endpoint = %endpoint, "WebSocket connected");
        self.spawn_connection(peer, stream);
        Ok(())
    }

    /// Accepts neighbours on `addr`. Returns the bound address and the accept loop.
    pub async fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Io(format!("bind {}: {}", addr, e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        info!(addr = %bound, "WebSocket listener started");

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let mut path = None;
                    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        path = Some(request.uri().path().to_string());
                        Ok(response)
                    };
                    let ws = match accept_hdr_async(stream, capture).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            warn!(remote = %remote, error = %e, "WebSocket handshake failed");
                            return;
                        }
                    };
                    match path.as_deref().and_then(peer_from_path) {
                        Some(peer) => {
                            info!(peer = %peer, remote = %remote, "WebSocket accepted");
                            transport.spawn_connection(peer, ws);
                        }
                        None => warn!(remote = %remote, path = ?path, "Rejecting connection without a node id"),
                    }
                });
            }
        });
        Ok((bound, handle))
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.peers.read().contains_key(peer)
    }

    fn spawn_connection<S>(self: &Arc<Self>, peer: NodeId, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.peers.write().insert(peer.clone(), tx.clone());
        let _ = self.events.send(TransportEvent::Connected(peer.clone()));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let bytes = match message {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "WebSocket read failed");
                        break;
                    }
                };
                let _ = transport.events.send(TransportEvent::Frame {
                    from: peer.clone(),
                    bytes,
                });
            }
            let mut peers = transport.peers.write();
            if peers.get(&peer).is_some_and(|current| current.same_channel(&tx)) {
                peers.remove(&peer);
                drop(peers);
                info!(peer = %peer, "WebSocket closed");
                let _ = transport.events.send(TransportEvent::Disconnected(peer));
            }
        });
    }
}

fn peer_from_path(path: &str) -> Option<NodeId> {
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    NodeId::new(segment).ok()
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, next_hop: &NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        let peers = self.peers.read();
        let sender = peers
            .get(next_hop)
            .ok_or_else(|| TransportError::NotConnected(next_hop.clone()))?;
        sender
            .send(message)
            .map_err(|_| TransportError::Closed(next_hop.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(raw: &str) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    #[test]
    fn test_peer_from_path() {
        assert_eq!(peer_from_path("/ocpp/CS001"), Some(node("CS001")));
        assert_eq!(peer_from_path("/ocpp/CS001/"), Some(node("CS001")));
        assert_eq!(peer_from_path("/"), None);
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (server, mut server_rx) = WebSocketTransport::new(node("CSMS"));
        let (addr, _accept) = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (client, mut client_rx) = WebSocketTransport::new(node("CS001"));
        client
            .connect(&format!("ws://{}/ocpp", addr), node("CSMS"))
            .await
            .unwrap();

        assert_eq!(client_rx.recv().await, Some(TransportEvent::Connected(node("CSMS"))));
        let connected = tokio::time::timeout(Duration::from_secs(5), server_rx.recv()).await.unwrap();
        assert_eq!(connected, Some(TransportEvent::Connected(node("CS001"))));

        client.send(&node("CSMS"), b"[2]".to_vec()).await.unwrap();
        assert_eq!(
            server_rx.recv().await,
            Some(TransportEvent::Frame {
                from: node("CS001"),
                bytes: b"[2]".to_vec()
            })
        );

        server.send(&node("CS001"), b"[3]".to_vec()).await.unwrap();
        assert_eq!(
            client_rx.recv().await,
            Some(TransportEvent::Frame {
                from: node("CSMS"),
                bytes: b"[3]".to_vec()
            })
        );

        let err = server.send(&node("CS999"), b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }
}
